use anyhow::{anyhow, Result};

use crate::mountpoint::Profile;
use crate::pipeline::PipelineSpec;
use crate::types::StreamKind;

/// Renders the DESCRIBE session description of a mountpoint.
///
/// Session-level attributes are fixed; the video block carries the feedback
/// lines clients need for FIR/NACK/PLI. Streams are addressed by
/// `streamid=<n>` controls in payloader order.
pub fn mount_description(
    spec: &PipelineSpec,
    profile: Profile,
    id: &str,
    interface: &str,
) -> Result<String> {
    let streams = spec.streams();
    if streams.is_empty() {
        return Err(anyhow!("no negotiated media for {}", id));
    }

    let mut lines = vec![
        "v=0".to_string(),
        format!("o=- 0 1 IN IP4 {}", interface),
        format!("s={}", id),
        "t=0 0".to_string(),
        "a=type:broadcast".to_string(),
        "a=control:*".to_string(),
        "a=range:npt=now-".to_string(),
    ];

    for (idx, stream) in streams.iter().enumerate() {
        let pt = stream.output_pt();
        match stream.kind {
            StreamKind::Video => {
                lines.push(format!("m=video 0 {} {}", profile.as_sdp(), pt));
                lines.push("c=IN IP4 0.0.0.0".to_string());
                lines.push(format!("a=rtpmap:{} {}/90000", pt, stream.codec.name()));
                lines.push(format!("a=rtcp-fb:{} ccm fir", pt));
                lines.push(format!("a=rtcp-fb:{} nack", pt));
                lines.push(format!("a=rtcp-fb:{} nack pli", pt));
            }
            StreamKind::Audio => {
                lines.push(format!("m=audio 0 {} {}", profile.as_sdp(), pt));
                lines.push("c=IN IP4 0.0.0.0".to_string());
                lines.push(format!("a=rtpmap:{} {}/48000/1", pt, stream.codec.name()));
            }
        }
        lines.push(format!("a=control:streamid={}", idx));
    }

    let mut sdp = lines.join("\r\n");
    sdp.push_str("\r\n");
    Ok(sdp)
}
