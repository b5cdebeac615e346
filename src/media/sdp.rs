use crate::error::ProtocolError;
use std::io::Cursor;
use tracing::debug;
use webrtc::sdp::SessionDescription;

const RTCP_MUX: &str = "a=rtcp-mux";

/// Insert `a=rtcp-mux` into the audio section when it is missing.
///
/// The attribute goes right after the section's `a=setup:` line, or at the
/// end of the section when there is none. Line endings follow the input and
/// nothing outside the audio section changes. Applying it twice is the same
/// as applying it once.
pub fn ensure_muxed_rtcp(sdp: &str) -> String {
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = sdp.split(eol).collect();

    let Some(start) = lines.iter().position(|l| l.starts_with("m=audio")) else {
        debug!("no audio section in sdp, leaving it untouched");
        return sdp.to_string();
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());
    let section = &lines[start..end];
    if section.iter().any(|l| l.trim_end() == RTCP_MUX) {
        return sdp.to_string();
    }

    let insert_at = match section.iter().position(|l| l.starts_with("a=setup:")) {
        Some(setup) => start + setup + 1,
        None => {
            // a trailing empty element is the final line ending, keep it last
            let mut at = end;
            while at > start + 1 && lines[at - 1].is_empty() {
                at -= 1;
            }
            at
        }
    };

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..insert_at]);
    out.push(RTCP_MUX);
    out.extend_from_slice(&lines[insert_at..]);
    debug!("inserted {} into audio section", RTCP_MUX);
    out.join(eol)
}

/// Parse a remote description before it is committed.
pub fn validate_remote_description(sdp: &str) -> Result<(), ProtocolError> {
    if sdp.trim().is_empty() {
        return Err(ProtocolError::MissingRemoteDescription);
    }
    let mut reader = Cursor::new(sdp.as_bytes());
    let parsed = SessionDescription::unmarshal(&mut reader)
        .map_err(|e| ProtocolError::MalformedRemoteDescription(e.to_string()))?;
    if !parsed
        .media_descriptions
        .iter()
        .any(|m| m.media_name.media == "audio")
    {
        return Err(ProtocolError::MalformedRemoteDescription(
            "no audio media section".to_string(),
        ));
    }
    Ok(())
}
