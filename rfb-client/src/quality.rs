//! Pure mapping from a user-selected quality level to the encoding preferences sent to
//! the server in `SetEncodings`.

/// User-selectable quality level, highest fidelity first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Highest,
    High,
    Medium,
    Low,
    Lowest,
}

/// Output of [`Quality::profile`]: everything the driver needs to negotiate encodings
/// with the server for a given quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub encodings: &'static str,
    pub compress_level: u8,
    pub quality_level: u8,
    pub jpeg_enabled: bool,
}

impl Quality {
    /// Pure function: same input always produces the same profile.
    pub fn profile(self) -> QualityProfile {
        let (encodings, quality_level) = match self {
            Quality::Highest => ("zrle ultra copyrect hextile zlib corre rre raw", 9),
            Quality::High => ("tight zywrle zrle ultra", 7),
            Quality::Medium => ("tight zywrle zrle ultra", 5),
            Quality::Low => ("tight zywrle zrle ultra", 3),
            Quality::Lowest => ("tight zywrle zrle ultra", 0),
        };
        QualityProfile {
            encodings,
            compress_level: 9,
            quality_level,
            jpeg_enabled: self != Quality::Highest,
        }
    }
}
