//! Command-line parsing into a [`Config`], mirroring `Configuration::from_args`'s
//! `getopts`-based shape: an `Options` table of flags, parsed once, then folded into the
//! config structs field by field.

use crate::config::Config;
use crate::error::{CllmError, Result};

/// Parses `args` (typically `std::env::args()`) into a [`Config`], starting from
/// `--config <path>` if given, then layering any other flags on top.
pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Config> {
    let mut opts = getopts::Options::new();
    opts.optopt("c", "config", "path to a TOML configuration file", "FILE");
    opts.optopt("", "num-workers", "number of worker threads (0 = auto)", "NUM");
    opts.optopt("", "epochs", "number of epochs to train", "NUM");
    opts.optopt("", "lr", "base learning rate", "FLOAT");
    opts.optopt("", "batch-size", "sequences per batch", "NUM");
    opts.optopt("", "seq-len", "tokens per sequence", "NUM");
    opts.optopt("", "seed", "seed for deterministic parameter initialization", "NUM");

    let matches = opts.parse(args).map_err(|e| CllmError::MalformedInput(format!("argument parse error: {e}")))?;

    let mut config = match matches.opt_str("config") {
        Some(path) => Config::from_toml_file(std::path::Path::new(&path))?,
        None => Config::default(),
    };

    if let Some(v) = matches.opt_str("num-workers") {
        config.runtime.num_worker_threads = parse_field(&v, "num-workers")?;
    }
    if let Some(v) = matches.opt_str("epochs") {
        config.training.num_epochs = parse_field(&v, "epochs")?;
    }
    if let Some(v) = matches.opt_str("lr") {
        config.training.learning_rate = parse_field(&v, "lr")?;
        config.optimizer.lr = config.training.learning_rate;
    }
    if let Some(v) = matches.opt_str("batch-size") {
        config.training.batch_size = parse_field(&v, "batch-size")?;
    }
    if let Some(v) = matches.opt_str("seq-len") {
        config.training.sequence_length = parse_field(&v, "seq-len")?;
    }
    if let Some(v) = matches.opt_str("seed") {
        config.runtime.seed = parse_field(&v, "seed")?;
    }

    Ok(config)
}

fn parse_field<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T> {
    raw.parse().map_err(|_| CllmError::MalformedInput(format!("invalid value for --{flag}: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let args = vec!["--num-workers".to_string(), "4".to_string(), "--lr".to_string(), "0.05".to_string()];
        let config = from_args(args.into_iter()).unwrap();
        assert_eq!(config.runtime.num_worker_threads, 4);
        assert!((config.training.learning_rate - 0.05).abs() < 1e-6);
        assert!((config.optimizer.lr - 0.05).abs() < 1e-6);
    }

    #[test]
    fn bad_numeric_flag_is_rejected() {
        let args = vec!["--epochs".to_string(), "not-a-number".to_string()];
        let err = from_args(args.into_iter()).unwrap_err();
        assert!(matches!(err, CllmError::MalformedInput(_)));
    }

    #[test]
    fn seed_flag_overrides_default() {
        let args = vec!["--seed".to_string(), "99".to_string()];
        let config = from_args(args.into_iter()).unwrap();
        assert_eq!(config.runtime.seed, 99);
    }

    #[test]
    fn no_flags_yields_defaults() {
        let config = from_args(std::iter::empty()).unwrap();
        assert_eq!(config.training.batch_size, Config::default().training.batch_size);
    }
}
