use anyhow::Result;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::util::Marshal;

/// Keyframe request toward the peer's encoder.
pub fn pli(media_ssrc: u32) -> Result<Vec<u8>> {
    let packet = PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc,
    };
    Ok(packet.marshal()?.to_vec())
}

/// Receiver-estimated maximum bitrate cap toward the peer's encoder.
pub fn remb(media_ssrc: u32, bitrate: u32) -> Result<Vec<u8>> {
    let packet = ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 0,
        bitrate: bitrate as f32,
        ssrcs: vec![media_ssrc],
    };
    Ok(packet.marshal()?.to_vec())
}

/// SSRC of an RTP packet, without touching the payload.
pub fn rtp_ssrc(data: &[u8]) -> Option<u32> {
    if data.len() < 12 || data[0] >> 6 != 2 {
        return None;
    }
    Some(u32::from_be_bytes([data[8], data[9], data[10], data[11]]))
}
