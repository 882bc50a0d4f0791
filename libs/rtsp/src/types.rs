/// Codecs the bridge can negotiate. The name mapping is the static
/// bijection used for `a=rtpmap` matching and pipeline caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Vp8,
    Vp9,
    H264,
    Opus,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::H264 => "H264",
            Codec::Opus => "opus",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("VP8") {
            Some(Codec::Vp8)
        } else if name.eq_ignore_ascii_case("VP9") {
            Some(Codec::Vp9)
        } else if name.eq_ignore_ascii_case("H264") {
            Some(Codec::H264)
        } else if name.eq_ignore_ascii_case("opus") {
            Some(Codec::Opus)
        } else {
            None
        }
    }

    pub fn is_video(&self) -> bool {
        !matches!(self, Codec::Opus)
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Codec::Opus => 48000,
            _ => 90000,
        }
    }

    /// Caps encoding-name, upper-case as the pipeline dialect expects.
    pub fn encoding_name(&self) -> &'static str {
        match self {
            Codec::Opus => "OPUS",
            other => other.name(),
        }
    }

    pub(crate) fn depay(&self) -> &'static str {
        match self {
            Codec::Vp8 => "rtpvp8depay",
            Codec::Vp9 => "rtpvp9depay",
            Codec::H264 => "rtph264depay",
            Codec::Opus => "rtpopusdepay",
        }
    }

    pub(crate) fn pay(&self) -> &'static str {
        match self {
            Codec::Vp8 => "rtpvp8pay",
            Codec::Vp9 => "rtpvp9pay",
            Codec::H264 => "rtph264pay",
            Codec::Opus => "rtpopuspay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn is_video(&self) -> bool {
        matches!(self, StreamKind::Video)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for codec in [Codec::Vp8, Codec::Vp9, Codec::H264, Codec::Opus] {
            assert_eq!(Codec::from_name(codec.name()), Some(codec));
        }
    }

    #[test]
    fn test_name_case_insensitive() {
        assert_eq!(Codec::from_name("vp8"), Some(Codec::Vp8));
        assert_eq!(Codec::from_name("OPUS"), Some(Codec::Opus));
        assert_eq!(Codec::from_name("h265"), None);
    }

    #[test]
    fn test_clock_rates() {
        assert_eq!(Codec::Vp8.clock_rate(), 90000);
        assert_eq!(Codec::Opus.clock_rate(), 48000);
    }
}
