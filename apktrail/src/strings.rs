use std::ffi::OsString;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::{open_archive, ArchiveError};
use crate::command::{split, CommandRunner, ExecRunner};
use crate::config::ProcessingSettings;
use crate::dex::{self, LengthMode};
use crate::tasks::CancelCheck;
use crate::Context;

#[derive(Error, Debug)]
pub enum SourceError {
    /// The container itself is damaged
    #[error("{0}")]
    Archive(ArchiveError),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(crate::Error),
}

impl From<ArchiveError> for SourceError {
    fn from(value: ArchiveError) -> Self {
        Self::Archive(value)
    }
}

impl From<crate::Error> for SourceError {
    fn from(value: crate::Error) -> Self {
        match value {
            crate::Error::Cancelled => Self::Cancelled,
            e => Self::Other(e),
        }
    }
}

/// Strings pulled from one artifact
#[derive(Debug, Default, Clone)]
pub struct ArtifactStrings {
    pub strings: Vec<String>,
    /// Bytecode images decoded successfully
    pub images: usize,
    /// Bytecode images skipped because they were malformed
    pub skipped_images: usize,
}

/// Produces the string pool contents of an artifact
pub trait StringSource: Send + Sync {
    fn strings(&self, apk: &Path, cancel: &dyn CancelCheck) -> Result<ArtifactStrings, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    #[default]
    Builtin,
    External,
}

/// Decodes every bytecode image in the archive in process
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinDecoder {
    mode: LengthMode,
}

impl BuiltinDecoder {
    pub fn new(mode: LengthMode) -> Self {
        Self { mode }
    }
}

impl StringSource for BuiltinDecoder {
    fn strings(&self, apk: &Path, cancel: &dyn CancelCheck) -> Result<ArtifactStrings, SourceError> {
        let mut out = ArtifactStrings::default();
        for entry in open_archive(apk)? {
            cancel.bail_if_cancelled()?;
            let entry = entry?;
            match dex::decode_with(entry.data, self.mode) {
                Ok(strings) => {
                    out.images += 1;
                    out.strings.extend(strings);
                }
                Err(e) => {
                    log::warn!("skipping {} in {:?}: {}", entry.name, apk, e);
                    out.skipped_images += 1;
                }
            }
        }
        Ok(out)
    }
}

/// Delegates to an external program that prints one decoded string per
/// line when given the artifact path as its final argument
pub struct ExternalDecoder<R> {
    program: String,
    args: Vec<String>,
    runner: R,
}

impl<R: CommandRunner> ExternalDecoder<R> {
    pub fn new(program: String, args: Vec<String>, runner: R) -> Self {
        Self {
            program,
            args,
            runner,
        }
    }

    /// Parse a shell style command line, resolving the program on `PATH`
    pub fn from_command_line(ctx: &dyn Context, cmdline: &str, runner: R) -> crate::Result<Self> {
        let mut parts = split(cmdline)
            .filter(|it| !it.is_empty())
            .ok_or_else(|| crate::Error::Generic(format!("invalid decoder command: {cmdline}")))?;
        let name = parts.remove(0);
        let program = ctx.get_bin(&name)?;
        Ok(Self::new(program, parts, runner))
    }
}

impl<R: CommandRunner> StringSource for ExternalDecoder<R> {
    fn strings(&self, apk: &Path, cancel: &dyn CancelCheck) -> Result<ArtifactStrings, SourceError> {
        cancel.bail_if_cancelled()?;
        let mut args = self.args.iter().map(OsString::from).collect::<Vec<_>>();
        args.push(apk.as_os_str().to_owned());
        let output = self
            .runner
            .run(&self.program, &args)
            .map_err(crate::Error::from)?
            .err_on_status()?;
        let strings = output
            .stdout_utf8_lossy()
            .lines()
            .filter(|it| !it.is_empty())
            .map(String::from)
            .collect();
        Ok(ArtifactStrings {
            strings,
            images: 1,
            skipped_images: 0,
        })
    }
}

/// Build the decoder selected by `processing.decoder`
pub fn string_source(
    ctx: &dyn Context,
    settings: &ProcessingSettings,
) -> crate::Result<Box<dyn StringSource>> {
    match settings.decoder {
        DecoderKind::Builtin => Ok(Box::new(BuiltinDecoder::new(settings.length_mode))),
        DecoderKind::External => {
            let cmdline = settings.external_decoder.as_deref().ok_or_else(|| {
                crate::Error::InvalidConfig(
                    "processing.external_decoder".into(),
                    "required when processing.decoder is \"external\"".into(),
                )
            })?;
            let decoder = ExternalDecoder::from_command_line(ctx, cmdline, ExecRunner)?;
            Ok(Box::new(decoder))
        }
    }
}
