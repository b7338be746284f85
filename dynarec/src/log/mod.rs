//! The implementation of the `DYNAREC_LOG*` environment variables.

use crate::config::BackendKind;
use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log changes to the contents of the block cache (invalidations, flushes).
    CacheEvent,
    /// Log JIT events (e.g. block translation, linking, backpatching).
    JitEvent,
}

/// Where log output goes.
enum Sink {
    Stderr,
    File(PathBuf),
}

impl Sink {
    /// `-` means stderr. Anything else is a file path: an existing file is truncated, so that
    /// appends don't mix with an earlier run's output.
    fn new(path: &str) -> Self {
        if path == "-" {
            Sink::Stderr
        } else {
            let path = PathBuf::from(path);
            File::create(&path).ok();
            Sink::File(path)
        }
    }

    fn write(&self, s: &str) {
        match self {
            Sink::Stderr => eprint!("{s}"),
            Sink::File(p) => {
                File::options()
                    .append(true)
                    .open(p)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
        }
    }
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    sink: Sink,
    /// Where to dump the code of each new block, and for which backends.
    code_dump: Option<(Sink, Vec<BackendKind>)>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        let mut log = match env::var("DYNAREC_LOG") {
            Ok(s) => Self::from_setting(&s)?,
            Err(_) => Self {
                level: Verbosity::Error,
                sink: Sink::Stderr,
                code_dump: None,
            },
        };
        if let Ok(s) = env::var("DYNAREC_LOG_IR") {
            log.code_dump = Some(Self::parse_code_dump(&s)?);
        }
        Ok(log)
    }

    /// Parse a `[<path|->:]<level>` string.
    pub(crate) fn from_setting(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => (path, level),
            [level] => ("-", level),
            [..] => return Err("DYNAREC_LOG must be of the format `[<path|->:]<level>".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid DYNAREC_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("DYNAREC_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self {
            level,
            sink: Sink::new(path),
            code_dump: None,
        })
    }

    /// Parse a `[<path>:]<kind>[,<kind>...]` string, where `ops` selects the op-stream backend's
    /// blocks and `asm` the x64 backend's.
    fn parse_code_dump(s: &str) -> Result<(Sink, Vec<BackendKind>), Box<dyn Error>> {
        let (path, kinds) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, kinds] => (path, kinds),
            [kinds] => ("-", kinds),
            [..] => {
                return Err("DYNAREC_LOG_IR must be of the format `[<path>:]<ops|asm>[,...]`".into())
            }
        };
        let kinds = kinds
            .split(',')
            .map(|k| match k {
                "ops" => Ok(BackendKind::Ops),
                "asm" => Ok(BackendKind::X64),
                _ => Err(format!("Invalid DYNAREC_LOG_IR value: {k}")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((Sink::new(path), kinds))
    }

    /// Will a message at `level` be written anywhere? Useful to avoid formatting expensive
    /// messages that would be discarded.
    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `verbosity`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "dynarec-error",
                Verbosity::Warning => "dynarec-warning",
                Verbosity::CacheEvent => "dynarec-cache-event",
                Verbosity::JitEvent => "dynarec-jit-event",
            };
            self.sink.write(&format!("{prefix}: {msg}\n"));
        }
    }

    /// Should blocks translated by `kind` be dumped?
    pub(crate) fn dumps_code(&self, kind: BackendKind) -> bool {
        matches!(&self.code_dump, Some((_, kinds)) if kinds.contains(&kind))
    }

    pub(crate) fn dump_code(&self, s: &str) {
        if let Some((sink, _)) = &self.code_dump {
            sink.write(s);
        }
    }
}
