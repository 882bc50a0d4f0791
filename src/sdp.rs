use std::collections::HashSet;

use rtsp::Codec;

/// Codecs stripped from the offer wholesale; the bridge never repackages
/// protection or retransmission payloads.
const STRIPPED_CODECS: [&str; 3] = ["ulpfec", "red", "rtx"];

/// Legacy trailing payload references removed from media lines when the
/// offer never binds them with an rtpmap.
const LEGACY_PTS: [u8; 5] = [116, 117, 96, 97, 98];

fn parse_rtpmap(line: &str) -> Option<(u8, &str)> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    let (pt, encoding) = rest.split_once(' ')?;
    let pt = pt.trim().parse().ok()?;
    let name = encoding.trim().split('/').next()?;
    Some((pt, name))
}

fn attribute_pt(line: &str) -> Option<u8> {
    for prefix in ["a=rtpmap:", "a=fmtp:", "a=rtcp-fb:"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return rest
                .split_whitespace()
                .next()
                .and_then(|pt| pt.parse().ok());
        }
    }
    None
}

fn lines(sdp: &str) -> impl Iterator<Item = &str> {
    sdp.lines().map(|line| line.trim_end_matches('\r'))
}

fn rebuild(parts: Vec<String>, original: &str) -> String {
    let mut sdp = parts.join("\r\n");
    if original.ends_with('\n') {
        sdp.push_str("\r\n");
    }
    sdp
}

/// First payload type declared for `codec` by an `a=rtpmap` line.
pub fn payload_type(sdp: &str, codec: Codec) -> Option<u8> {
    lines(sdp).find_map(|line| {
        let (pt, name) = parse_rtpmap(line)?;
        (Codec::from_name(name) == Some(codec)).then_some(pt)
    })
}

pub fn codec_for_payload(sdp: &str, pt: u8) -> Option<Codec> {
    lines(sdp).find_map(|line| {
        let (line_pt, name) = parse_rtpmap(line)?;
        (line_pt == pt).then(|| Codec::from_name(name))?
    })
}

/// Codec and payload type of the first format on the `m=<media>` line.
pub fn first_media_codec(sdp: &str, media: &str) -> Option<(Codec, u8)> {
    let prefix = format!("m={} ", media);
    let line = lines(sdp).find(|line| line.starts_with(&prefix))?;
    let pt: u8 = line.split_whitespace().nth(3)?.parse().ok()?;
    let codec = codec_for_payload(sdp, pt)?;
    Some((codec, pt))
}

pub fn video_codec(sdp: &str) -> Option<Codec> {
    first_media_codec(sdp, "video").map(|(codec, _)| codec)
}

pub fn audio_codec(sdp: &str) -> Option<Codec> {
    first_media_codec(sdp, "audio").map(|(codec, _)| codec)
}

pub fn has_media(sdp: &str, media: &str) -> bool {
    let prefix = format!("m={} ", media);
    lines(sdp).any(|line| line.starts_with(&prefix))
}

/// First codec of the configured priority list that the offer declares.
pub fn select_video_codec_by_priority(sdp: &str, priority: &[Codec]) -> Option<Codec> {
    priority
        .iter()
        .copied()
        .find(|codec| payload_type(sdp, *codec).is_some())
}

/// Reorders the video `m=` line so the chosen codec's payload type comes
/// first; the other formats keep their relative order. The SDP is returned
/// unchanged when there is nothing to choose, the choice is already first,
/// or the line cannot be parsed.
pub fn rewrite_video_line(sdp: &str, chosen: Option<Codec>) -> String {
    let Some(chosen) = chosen else {
        return sdp.to_string();
    };
    let Some(pt) = payload_type(sdp, chosen) else {
        return sdp.to_string();
    };
    let pt = pt.to_string();

    let mut changed = false;
    let mut seen_video = false;
    let parts: Vec<String> = lines(sdp)
        .map(|line| {
            if seen_video || !line.starts_with("m=video ") {
                return line.to_string();
            }
            seen_video = true;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 4 {
                return line.to_string();
            }
            let formats = &tokens[3..];
            if formats[0] == pt || !formats.contains(&pt.as_str()) {
                return line.to_string();
            }
            let mut reordered = vec![tokens[0], tokens[1], tokens[2], pt.as_str()];
            reordered.extend(formats.iter().filter(|f| **f != pt));
            changed = true;
            reordered.join(" ")
        })
        .collect();

    if !changed {
        return sdp.to_string();
    }
    rebuild(parts, sdp)
}

/// Rewrites the peer's offer for the bounce-back orientation: direction
/// attributes are downgraded one step, protection/retransmission payloads
/// are dropped, and unbound legacy payload references disappear from the
/// media lines.
pub fn munge_offer(sdp: &str) -> String {
    let mut bound = HashSet::new();
    let mut strip = HashSet::new();
    for line in lines(sdp) {
        if let Some((pt, name)) = parse_rtpmap(line) {
            bound.insert(pt);
            if STRIPPED_CODECS
                .iter()
                .any(|codec| name.eq_ignore_ascii_case(codec))
            {
                strip.insert(pt);
            }
        }
    }
    for pt in LEGACY_PTS {
        if !bound.contains(&pt) {
            strip.insert(pt);
        }
    }

    let parts: Vec<String> = lines(sdp)
        .filter(|line| match attribute_pt(line) {
            Some(pt) => !strip.contains(&pt),
            None => true,
        })
        .map(|line| {
            if line == "a=recvonly" {
                return "a=inactive".to_string();
            }
            if line == "a=sendonly" {
                return "a=recvonly".to_string();
            }
            if line.starts_with("m=") {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.len() > 3 {
                    let mut kept = tokens[..3].to_vec();
                    kept.extend(tokens[3..].iter().filter(|f| {
                        f.parse::<u8>()
                            .map(|pt| !strip.contains(&pt))
                            .unwrap_or(true)
                    }));
                    return kept.join(" ");
                }
            }
            line.to_string()
        })
        .collect();

    rebuild(parts, sdp)
}
