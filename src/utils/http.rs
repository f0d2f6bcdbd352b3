use bytes::Bytes;
use futures_util::StreamExt;

/// Reads at most `max_bytes` of a response body.
///
/// Returns the collected bytes and whether the body was cut short. A chunk
/// error mid-stream is returned as-is so callers can tell a broken transport
/// from a large body.
pub(crate) async fn read_body_bounded(
    response: reqwest::Response,
    max_bytes: usize,
) -> Result<(Bytes, bool), reqwest::Error> {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let chunk = next?;
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }
    Ok((Bytes::from(out), truncated))
}

/// Lossy text view of a bounded body, marking truncation the way error
/// messages elsewhere in the crate do.
pub(crate) fn body_text(bytes: &[u8], truncated: bool) -> String {
    let mut body = String::from_utf8_lossy(bytes).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}
