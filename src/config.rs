use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::admission::AdmissionLimits;
use crate::app_state::{DomainMatchMode, DomainPolicy};
use crate::error::ConfigError;

/// Command line arguments, each with an environment fallback
#[derive(Parser, Debug, Clone)]
#[command(name = "avif2webp")]
#[command(about = "AVIF to WebP conversion proxy")]
pub struct Args {
    /// Listen address
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = 3080)]
    pub port: u16,

    /// Maximum source size in bytes
    #[arg(long, env = "SIZE_LIMIT", default_value_t = 10 * 1024 * 1024)]
    pub size_limit: u64,

    /// Maximum decoded pixel count
    #[arg(long, env = "MAX_PIXELS", default_value_t = 2560 * 1440)]
    pub max_pixels: u64,

    /// Accepted requests per client per window
    #[arg(long, env = "RATE_LIMIT_COUNT", default_value_t = 30)]
    pub rate_limit_count: u32,

    /// Rate limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW", default_value_t = 60)]
    pub rate_limit_window: u64,

    /// Lifetime of converted and rejected entries in seconds
    #[arg(long, env = "CACHE_TTL", default_value_t = 3600)]
    pub cache_ttl: u64,

    /// Lifetime of failed entries in seconds
    #[arg(long, env = "FAILURE_TTL", default_value_t = 5)]
    pub failure_ttl: u64,

    /// Maximum number of cached conversions
    #[arg(long, env = "CACHE_CAPACITY", default_value_t = 1024)]
    pub cache_capacity: usize,

    /// Outbound request timeout in seconds
    #[arg(long, env = "FETCH_TIMEOUT", default_value_t = 30)]
    pub fetch_timeout: u64,

    /// Directory served by /local
    #[arg(long, env = "IMAGES_DIR", default_value = "./images")]
    pub images_dir: PathBuf,

    /// Host patterns, `;` separated, `*` wildcards allowed
    #[arg(long, env = "DOMAINS", value_delimiter = ';')]
    pub domains: Vec<String>,

    /// How `domains` is applied
    #[arg(long, env = "MODE", value_enum, default_value_t = DomainMatchMode::Blacklist)]
    pub mode: DomainMatchMode,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: SocketAddr,
    pub limits: AdmissionLimits,
    pub rate_limit_count: u32,
    pub rate_limit_window: Duration,
    pub cache_ttl: Duration,
    pub failure_ttl: Duration,
    pub cache_capacity: NonZeroUsize,
    pub fetch_timeout: Duration,
    pub images_dir: PathBuf,
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let nonzero = |value: u64, name: &'static str| {
            if value == 0 {
                Err(ConfigError::Zero(name))
            } else {
                Ok(value)
            }
        };

        let host: IpAddr = args.host.parse()?;
        let cache_capacity =
            NonZeroUsize::new(args.cache_capacity).ok_or(ConfigError::Zero("cache_capacity"))?;

        Ok(Settings {
            addr: SocketAddr::new(host, args.port),
            limits: AdmissionLimits {
                size_limit: nonzero(args.size_limit, "size_limit")?,
                max_pixels: nonzero(args.max_pixels, "max_pixels")?,
                source_extension: "avif".into(),
                domains: DomainPolicy::new(args.mode, &args.domains)?,
            },
            rate_limit_count: nonzero(args.rate_limit_count.into(), "rate_limit_count")? as u32,
            rate_limit_window: Duration::from_secs(nonzero(args.rate_limit_window, "rate_limit_window")?),
            cache_ttl: Duration::from_secs(nonzero(args.cache_ttl, "cache_ttl")?),
            failure_ttl: Duration::from_secs(args.failure_ttl),
            cache_capacity,
            fetch_timeout: Duration::from_secs(nonzero(args.fetch_timeout, "fetch_timeout")?),
            images_dir: args.images_dir.clone(),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            addr: SocketAddr::from(([0, 0, 0, 0], 3080)),
            limits: AdmissionLimits::default(),
            rate_limit_count: 30,
            rate_limit_window: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(3600),
            failure_ttl: Duration::from_secs(5),
            cache_capacity: NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN),
            fetch_timeout: Duration::from_secs(30),
            images_dir: PathBuf::from("./images"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("avif2webp").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_documented_limits() {
        let settings = Settings::from_args(&parse(&[])).unwrap();
        assert_eq!(settings.limits.size_limit, 10 * 1024 * 1024);
        assert_eq!(settings.limits.max_pixels, 2560 * 1440);
        assert_eq!(settings.rate_limit_count, 30);
        assert_eq!(settings.rate_limit_window, Duration::from_secs(60));
        assert_eq!(settings.cache_ttl, Duration::from_secs(3600));
        assert!(settings.limits.domains.is_allowed("example.com"));
    }

    #[test]
    fn domains_are_semicolon_separated() {
        let args = parse(&["--domains", "*.example.com;cdn.test", "--mode", "whitelist"]);
        let settings = Settings::from_args(&args).unwrap();
        assert!(settings.limits.domains.is_allowed("img.example.com"));
        assert!(settings.limits.domains.is_allowed("cdn.test"));
        assert!(!settings.limits.domains.is_allowed("other.test"));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = Settings::from_args(&parse(&["--cache-capacity", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("cache_capacity")));

        let err = Settings::from_args(&parse(&["--size-limit", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("size_limit")));
    }

    #[test]
    fn bad_host_is_rejected() {
        let err = Settings::from_args(&parse(&["--host", "not-an-ip"])).unwrap_err();
        assert!(matches!(err, ConfigError::Address(_)));
    }
}
