use std::collections::BTreeMap;
use std::io::{self, Write};
use std::thread::JoinHandle;

use anyhow::bail;
use serde::Serialize;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::{Handle, Signals};

use apktrail::admission::SessionMetadata;
use apktrail::tasks::{TaskCancelCheck, TaskCanceller};
use apktrail::{Context, Runtime, Settings};

pub struct HookedSignals {
    sig_handle: Handle,
    _join_handle: JoinHandle<()>,
}

impl Drop for HookedSignals {
    fn drop(&mut self) {
        if !self.sig_handle.is_closed() {
            self.sig_handle.close();
        }
    }
}

/// Cancel on the first termination signal, behave as normal on the second
pub fn hook_to_signals(cancel: TaskCanceller) -> anyhow::Result<HookedSignals> {
    let mut sigs = Signals::new(TERM_SIGNALS)?;
    let sig_handle = sigs.handle();
    let _join_handle = std::thread::spawn(move || {
        let mut seen_exit = false;
        for sig in sigs.forever() {
            if seen_exit {
                _ = signal_hook::low_level::emulate_default_handler(sig);
            } else {
                log::warn!("received signal {}, cancelling", sig);
                cancel.cancel();
                seen_exit = true;
            }
        }
    });

    Ok(HookedSignals {
        sig_handle,
        _join_handle,
    })
}

pub fn task_canceller() -> anyhow::Result<(HookedSignals, TaskCancelCheck)> {
    let (cancel, check) = TaskCanceller::new();
    Ok((hook_to_signals(cancel)?, check))
}

/// Load the settings and assemble the process wide runtime from them
pub fn get_runtime(ctx: &dyn Context) -> anyhow::Result<(Settings, Runtime)> {
    let settings = ctx.get_settings()?;
    let rt = Runtime::from_context(ctx, &settings)?;
    Ok((settings, rt))
}

/// Parse repeated `key=value` arguments
pub fn parse_metadata(raw: &[String]) -> anyhow::Result<SessionMetadata> {
    let mut meta = BTreeMap::new();
    for it in raw {
        let Some((k, v)) = it.split_once('=') else {
            bail!("invalid metadata {it:?}, expected key=value");
        };
        if k.is_empty() {
            bail!("invalid metadata {it:?}, empty key");
        }
        meta.insert(k.to_string(), v.to_string());
    }
    Ok(meta)
}

pub fn write_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    serde_json::to_writer_pretty(&mut lock, value)?;
    writeln!(lock)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(&[], &[])]
    #[case(&["team=red"], &[("team", "red")])]
    #[case(&["a=1", "b=x=y"], &[("a", "1"), ("b", "x=y")])]
    #[case(&["empty="], &[("empty", "")])]
    fn test_parse_metadata(#[case] raw: &[&str], #[case] expected: &[(&str, &str)]) {
        let raw = raw.iter().map(|it| it.to_string()).collect::<Vec<_>>();
        let got = parse_metadata(&raw).unwrap();
        let expected = expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<SessionMetadata>();
        assert_eq!(got, expected);
    }

    #[rstest]
    #[case("novalue")]
    #[case("=value")]
    fn test_parse_metadata_invalid(#[case] raw: &str) {
        assert!(parse_metadata(&[raw.to_string()]).is_err());
    }
}
