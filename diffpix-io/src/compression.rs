//! Snapshot compression setting.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Default gzip level when none is given.
pub const DEFAULT_GZIP_LEVEL: u8 = 4;

/// Filter applied to every dataset of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    /// Deflate at the given level (0-9).
    Gzip(u8),
    Lzf,
}

impl FromStr for Compression {
    type Err = Error;

    /// Parses `"none"`, `"gzip"`, `"gzip=N"` or `"lzf"` (case-insensitive).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "" | "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip(DEFAULT_GZIP_LEVEL)),
            "lzf" => Ok(Self::Lzf),
            other => {
                let level = other
                    .strip_prefix("gzip=")
                    .and_then(|level| level.parse::<u8>().ok())
                    .filter(|&level| level <= 9)
                    .ok_or_else(|| {
                        Error::InvalidFormat(format!("unknown compression \"{other}\""))
                    })?;
                Ok(Self::Gzip(level))
            }
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Gzip(level) => write!(f, "gzip={level}"),
            Self::Lzf => f.write_str("lzf"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compression() {
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert_eq!("LZF".parse::<Compression>().unwrap(), Compression::Lzf);
        assert_eq!(
            "gzip".parse::<Compression>().unwrap(),
            Compression::Gzip(DEFAULT_GZIP_LEVEL)
        );
        assert_eq!("gzip=9".parse::<Compression>().unwrap(), Compression::Gzip(9));
        assert!("gzip=10".parse::<Compression>().is_err());
        assert!("zstd".parse::<Compression>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for compression in [Compression::None, Compression::Gzip(2), Compression::Lzf] {
            assert_eq!(
                compression.to_string().parse::<Compression>().unwrap(),
                compression
            );
        }
    }
}
