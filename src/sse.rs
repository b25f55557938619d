/// Reassembles upstream SSE bytes into `data:` payloads.
///
/// Chunk boundaries from the transport never line up with lines, so bytes are
/// held until a `\n` arrives. Decoding happens per complete line, which keeps
/// multi-byte characters split across chunks intact.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the payload of every `data:` line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|b| *b == b'\n')
            .filter_map(data_payload)
            .collect()
    }

    /// Flushes a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.pending);
        data_payload(&tail)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let payload = line.trim_end_matches('\r').strip_prefix("data:")?;
    Some(payload.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"event: message\nda").is_empty());
        assert!(buf.push(b"ta: {\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\n\ndata: [DONE]\n"), vec!["{\"a\":1}", "[DONE]"]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn multibyte_characters_split_across_chunks_survive() {
        let line = "data: {\"text\":\"héllo 👋\"}\n".as_bytes();
        let cut = line.iter().position(|b| *b == 0xF0).unwrap() + 2;
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(&line[..cut]).is_empty());
        assert_eq!(buf.push(&line[cut..]), vec!["{\"text\":\"héllo 👋\"}"]);
    }

    #[test]
    fn unterminated_final_line_is_flushed() {
        let mut buf = SseLineBuffer::new();
        assert_eq!(buf.push(b"data: one\ndata: two"), vec!["one"]);
        assert_eq!(buf.finish().as_deref(), Some("two"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn non_data_lines_are_ignored_and_crlf_tolerated() {
        let mut buf = SseLineBuffer::new();
        let out = buf.push(b": keepalive\r\nevent: x\r\ndata:{\"b\":2}\r\n\r\nid: 7\n");
        assert_eq!(out, vec!["{\"b\":2}"]);
        buf.push(b"retry: 10");
        assert_eq!(buf.finish(), None);
    }
}
