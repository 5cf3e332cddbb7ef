//! Command-line argument parsing for VNC client applications.
//!
//! This module is only available when the `cli` feature is enabled.
//! It provides a structured way to parse command-line arguments and
//! convert them into a `Config` object.
//!
//! # Examples
//!
//! ```no_run
//! use rfb_client::args::Args;
//! use rfb_client::Config;
//!
//! let args = Args::parse();
//! let config = Config::from_args(args)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::{Config, QualityLevel};
use crate::host_address::HostAddress;
use clap::Parser;

/// VNC client command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// VNC server address (host:port, host:display, or any form `HostAddress` accepts)
    ///
    /// Examples:
    ///   - localhost:5900
    ///   - 192.168.1.100:0 (display :0 = port 5900)
    ///   - vnc.example.com:1 (display :1 = port 5901)
    ///   - [2001:db8::1]:5901
    #[arg(value_name = "SERVER")]
    pub server: String,

    /// Server port (overrides port parsed from SERVER if specified)
    #[arg(short = 'p', long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Password for authentication
    #[arg(short = 'P', long, value_name = "PASSWORD", env = "VNC_PASSWORD")]
    pub password: Option<String>,

    /// Encoding quality level
    #[arg(short = 'q', long, value_enum, default_value_t = CliQuality::High)]
    pub quality: CliQuality,

    /// Preferred encodings (comma-separated), overriding the quality-derived default
    ///
    /// Available: raw, copyrect, rre, hextile, tight, zrle
    #[arg(short = 'e', long, value_name = "ENCODINGS", value_delimiter = ',')]
    pub encodings: Option<Vec<String>>,

    /// View-only mode (no input events sent)
    #[arg(long)]
    pub view_only: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// `clap`-friendly mirror of [`crate::quality::Quality`] / [`QualityLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliQuality {
    Highest,
    High,
    Medium,
    Low,
    Lowest,
}

impl From<CliQuality> for QualityLevel {
    fn from(q: CliQuality) -> Self {
        match q {
            CliQuality::Highest => QualityLevel::Highest,
            CliQuality::High => QualityLevel::High,
            CliQuality::Medium => QualityLevel::Medium,
            CliQuality::Low => QualityLevel::Low,
            CliQuality::Lowest => QualityLevel::Lowest,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    #[must_use]
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Parse arguments from an iterator.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments are invalid.
    pub fn try_parse_from<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(iter)
    }
}

impl Config {
    /// Create a configuration from command-line arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the server address cannot be resolved to a usable host, or
    /// if the resulting configuration fails validation.
    pub fn from_args(args: Args) -> Result<Self, crate::errors::RfbClientError> {
        let parsed = HostAddress::parse(&args.server);

        let mut builder = Config::builder()
            .host(parsed.host)
            .quality(args.quality.into());

        let port = args.port.or(parsed.port).unwrap_or(5900);
        builder = builder.port(port);

        if let Some(password) = args.password {
            builder = builder.password(password);
        }

        let mut config = builder.build()?;

        if let Some(names) = &args.encodings {
            config.display.encodings = parse_encodings(names)?;
        }
        config.security.view_only = args.view_only;

        Ok(config)
    }
}

/// Parse encoding names to encoding IDs.
fn parse_encodings(names: &[String]) -> Result<Vec<i32>, crate::errors::RfbClientError> {
    use rfb_protocol::messages::types::{
        ENCODING_COPYRECT, ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE, ENCODING_TIGHT,
        ENCODING_ZRLE,
    };

    let mut encodings = Vec::new();
    for name in names {
        let encoding = match name.to_lowercase().as_str() {
            "raw" => ENCODING_RAW,
            "copyrect" | "copy-rect" => ENCODING_COPYRECT,
            "rre" => ENCODING_RRE,
            "hextile" => ENCODING_HEXTILE,
            "tight" => ENCODING_TIGHT,
            "zrle" => ENCODING_ZRLE,
            _ => {
                return Err(crate::errors::RfbClientError::Config(format!(
                    "Unknown encoding: {name}"
                )))
            }
        };
        encodings.push(encoding);
    }

    Ok(encodings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_args_plain_host_port() {
        let args = Args::try_parse_from(["test", "localhost:5901"]).unwrap();
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 5901);
    }

    #[test]
    fn test_from_args_explicit_port_overrides_parsed() {
        let args = Args::try_parse_from(["test", "localhost:5901", "--port", "5999"]).unwrap();
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.connection.port, 5999);
    }

    #[test]
    fn test_from_args_defaults_to_5900_with_no_port() {
        let args = Args::try_parse_from(["test", "example.local"]).unwrap();
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.connection.host, "example.local");
        assert_eq!(config.connection.port, 5900);
    }

    #[test]
    fn test_from_args_bracketed_ipv6() {
        let args = Args::try_parse_from(["test", "[2001:db8::1]:5901"]).unwrap();
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.connection.host, "2001:db8::1");
        assert_eq!(config.connection.port, 5901);
    }

    #[test]
    fn test_parse_encodings() {
        let names = vec!["raw".to_string(), "tight".to_string(), "zrle".to_string()];
        let encodings = parse_encodings(&names).unwrap();
        assert_eq!(encodings.len(), 3);
    }

    #[test]
    fn test_parse_encodings_invalid() {
        let names = vec!["invalid".to_string()];
        assert!(parse_encodings(&names).is_err());
    }

    #[test]
    fn test_args_minimal() {
        let args = Args::try_parse_from(["test", "localhost:5900"]).unwrap();
        assert_eq!(args.server, "localhost:5900");
        assert_eq!(args.port, None);
        assert_eq!(args.quality, CliQuality::High);
    }

    #[test]
    fn test_args_with_options() {
        let args = Args::try_parse_from([
            "test",
            "localhost:5900",
            "--quality",
            "highest",
            "--encodings",
            "tight,zrle",
        ])
        .unwrap();
        assert_eq!(args.quality, CliQuality::Highest);
        assert_eq!(args.encodings.as_ref().unwrap().len(), 2);
    }
}
