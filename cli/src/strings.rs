use std::path::PathBuf;

use clap::{self, Args};
use itertools::Itertools;
use serde::Serialize;

use apktrail::extract::{extract_indicators, sanitize, Highlighter};
use apktrail::strings::string_source;
use apktrail::Context;

use crate::utils::{task_canceller, write_json};

#[derive(Serialize)]
struct Labelled<'a> {
    url: &'a str,
    host: &'a str,
    domain: &'a str,
    label: Option<&'a str>,
}

#[derive(Args)]
pub struct Strings {
    /// The APK to decode
    apk: PathBuf,

    #[arg(
        short,
        long,
        help = "Print the URL indicators instead of the raw strings",
        action = clap::ArgAction::SetTrue,
        default_value_t = false,
    )]
    indicators: bool,

    #[arg(
        short,
        long,
        help = "Sort and deduplicate the raw strings",
        action = clap::ArgAction::SetTrue,
        default_value_t = false,
    )]
    unique: bool,

    #[arg(
        short,
        long,
        help = "Print as JSON",
        action = clap::ArgAction::SetTrue,
        default_value_t = false,
    )]
    json: bool,
}

impl Strings {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        let settings = ctx.get_settings()?;
        let source = string_source(ctx, &settings.processing)?;
        let (_signals, check) = task_canceller()?;

        let decoded = source.strings(&self.apk, &check)?;
        log::info!(
            "{} strings from {} images, {} skipped",
            decoded.strings.len(),
            decoded.images,
            decoded.skipped_images
        );

        if self.indicators {
            let highlighter = Highlighter::new(settings.highlights.clone());
            let found = extract_indicators(decoded.strings.iter().map(String::as_str));
            let labelled = found
                .iter()
                .map(|it| Labelled {
                    url: &it.url,
                    host: &it.host,
                    domain: &it.domain,
                    label: highlighter.classify(it),
                })
                .collect::<Vec<_>>();
            if self.json {
                return write_json(&labelled);
            }
            for it in labelled {
                match it.label {
                    Some(label) => println!("{} [{}]", it.url, label),
                    None => println!("{}", it.url),
                }
            }
            return Ok(());
        }

        let strings: Vec<String> = if self.unique {
            decoded
                .strings
                .into_iter()
                .map(|it| sanitize(&it).into_owned())
                .sorted()
                .dedup()
                .collect()
        } else {
            decoded.strings
        };

        if self.json {
            write_json(&strings)
        } else {
            for s in &strings {
                println!("{}", s.escape_debug());
            }
            Ok(())
        }
    }
}
