use std::{env, path::PathBuf};

use anyhow::{anyhow, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExperimentMode {
    /// Whole dataset, configured epoch count.
    Full,
    /// Small subset and a short schedule, for smoke runs.
    Test,
}

impl ExperimentMode {
    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "full" => Ok(Self::Full),
            "test" => Ok(Self::Test),
            other => Err(anyhow!("invalid mode: {}", other)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Test => "test",
        }
    }

    pub fn select<T>(&self, full: T, test: T) -> T {
        match self {
            Self::Full => full,
            Self::Test => test,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunArgs {
    mode: ExperimentMode,
    config_path: Option<PathBuf>,
    help_requested: bool,
}

impl RunArgs {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args().skip(1))
    }

    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut mode: Option<ExperimentMode> = None;
        let mut config_path: Option<PathBuf> = None;
        let mut help_requested = false;
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            if arg == "--mode" || arg == "-m" {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("expected value after {}", arg))?;
                mode = Some(ExperimentMode::from_str(&value)?);
            } else if arg == "--config" || arg == "-c" {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("expected value after {}", arg))?;
                config_path = Some(PathBuf::from(value));
            } else if arg == "--help" || arg == "-h" {
                help_requested = true;
            } else if let Some(mode_value) = arg.strip_prefix("--mode=") {
                mode = Some(ExperimentMode::from_str(mode_value)?);
            } else if let Some(path) = arg.strip_prefix("--config=") {
                config_path = Some(PathBuf::from(path));
            } else {
                return Err(anyhow!("unexpected argument: {}", arg));
            }
        }

        Ok(Self {
            mode: mode.unwrap_or(ExperimentMode::Full),
            config_path,
            help_requested,
        })
    }

    pub fn help_requested(&self) -> bool {
        self.help_requested
    }

    pub fn mode(&self) -> ExperimentMode {
        self.mode
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RunArgs> {
        RunArgs::parse(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn defaults_to_full_mode() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.mode(), ExperimentMode::Full);
        assert!(args.config_path().is_none());
        assert!(!args.help_requested());
    }

    #[test]
    fn accepts_both_flag_forms() {
        let args = parse(&["--mode", "test", "--config=run.json"]).unwrap();
        assert_eq!(args.mode(), ExperimentMode::Test);
        assert_eq!(args.config_path(), Some(&PathBuf::from("run.json")));

        let args = parse(&["--mode=full", "-c", "other.json", "-h"]).unwrap();
        assert_eq!(args.mode(), ExperimentMode::Full);
        assert_eq!(args.config_path(), Some(&PathBuf::from("other.json")));
        assert!(args.help_requested());
    }

    #[test]
    fn rejects_unknown_input() {
        assert!(parse(&["--mode", "fast"]).is_err());
        assert!(parse(&["--epochs", "3"]).is_err());
        assert!(parse(&["--config"]).is_err());
    }

    #[test]
    fn select_picks_by_mode() {
        assert_eq!(ExperimentMode::Full.select(10, 1), 10);
        assert_eq!(ExperimentMode::Test.select(10, 1), 1);
    }
}
