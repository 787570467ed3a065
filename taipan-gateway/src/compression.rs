//! Zlib-stream reassembly for inbound gateway frames.
//!
//! The gateway deflates every payload into one long-lived zlib stream per
//! connection. A payload's final frame ends with the SYNC_FLUSH suffix
//! `00 00 FF FF`; anything before that is a fragment to be buffered.

use flate2::{Decompress, FlushDecompress, Status};

/// Marker terminating a complete compressed payload.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Growth step for the inflate output buffer.
const INFLATE_CHUNK: usize = 16 * 1024;

/// Streaming inflater shared by all frames of one connection.
///
/// The inflate context carries dictionary state across payloads, so it must
/// live exactly as long as the socket: [`StreamInflater::reset`] is called
/// whenever a new connection is opened and never in between.
pub struct StreamInflater {
    buffer: Vec<u8>,
    state: Decompress,
}

impl StreamInflater {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8 * 1024),
            state: Decompress::new(true),
        }
    }

    /// Append one binary frame.
    ///
    /// Returns the decoded payload once the accumulated buffer ends with the
    /// full-flush suffix, `None` while the payload is still fragmented.
    pub fn extend(&mut self, frame: &[u8]) -> std::io::Result<Option<String>> {
        self.buffer.extend_from_slice(frame);

        if self.buffer.len() < 4 || self.buffer[self.buffer.len() - 4..] != ZLIB_SUFFIX {
            return Ok(None);
        }

        let inflated = self.inflate()?;
        self.buffer.clear();

        String::from_utf8(inflated)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn inflate(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.buffer.len().max(INFLATE_CHUNK));
        let mut read = 0usize;

        loop {
            out.reserve(INFLATE_CHUNK);
            let in_before = self.state.total_in();
            let status = self
                .state
                .decompress_vec(&self.buffer[read..], &mut out, FlushDecompress::Sync)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            read += (self.state.total_in() - in_before) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // Done once all input is consumed and the inflater had
                    // spare room for any remaining output.
                    if read >= self.buffer.len() && out.len() < out.capacity() {
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    /// Drop buffered fragments and restart the inflate context for a new
    /// connection.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state.reset(true);
    }
}

impl Default for StreamInflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    /// Deflate one payload into the shared stream, ending on a sync flush so
    /// the frame carries the `00 00 FF FF` suffix like the real gateway.
    fn deflate_payload(stream: &mut Compress, payload: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 64);
        let mut read = 0usize;
        loop {
            out.reserve(64);
            let in_before = stream.total_in();
            stream
                .compress_vec(&payload.as_bytes()[read..], &mut out, FlushCompress::Sync)
                .unwrap();
            read += (stream.total_in() - in_before) as usize;
            if read >= payload.len() && out.ends_with(&ZLIB_SUFFIX) {
                return out;
            }
        }
    }

    #[test]
    fn whole_frame_is_decoded() {
        let mut stream = Compress::new(Compression::default(), true);
        let mut inflater = StreamInflater::new();

        let payload = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let frame = deflate_payload(&mut stream, payload);

        let decoded = inflater.extend(&frame).unwrap();
        assert_eq!(decoded.as_deref(), Some(payload));
    }

    #[test]
    fn consecutive_payloads_share_the_context() {
        let mut stream = Compress::new(Compression::default(), true);
        let mut inflater = StreamInflater::new();

        let first = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let second = r#"{"t":"READY","s":1,"op":0,"d":{"session_id":"abc"}}"#;

        let decoded = inflater.extend(&deflate_payload(&mut stream, first)).unwrap();
        assert_eq!(decoded.as_deref(), Some(first));

        let decoded = inflater.extend(&deflate_payload(&mut stream, second)).unwrap();
        assert_eq!(decoded.as_deref(), Some(second));
    }

    #[test]
    fn fragments_are_buffered_until_the_suffix() {
        let mut stream = Compress::new(Compression::default(), true);
        let mut inflater = StreamInflater::new();

        let payload = r#"{"op":0,"s":2,"t":"MESSAGE_CREATE","d":{"content":"hello there"}}"#;
        let frame = deflate_payload(&mut stream, payload);

        // Split so no fragment accidentally ends with the suffix.
        let (head, tail) = frame.split_at(frame.len() - 2);
        assert_eq!(inflater.extend(head).unwrap(), None);
        assert_eq!(inflater.extend(tail).unwrap().as_deref(), Some(payload));
    }

    #[test]
    fn no_payload_is_emitted_early_or_lost_across_splits() {
        let payloads: Vec<String> = (0..6)
            .map(|i| format!(r#"{{"op":0,"s":{i},"t":"TEST","d":{{"n":{i},"body":"{}"}}}}"#, "x".repeat(40 * i)))
            .collect();

        // Try a range of fragment sizes over the same logical stream.
        for split in [1usize, 3, 7, 16, 64] {
            let mut stream = Compress::new(Compression::default(), true);
            let mut inflater = StreamInflater::new();
            let mut decoded = Vec::new();

            for payload in &payloads {
                let frame = deflate_payload(&mut stream, payload);
                let mut offset = 0;
                while offset < frame.len() {
                    let end = (offset + split).min(frame.len());
                    if let Some(message) = inflater.extend(&frame[offset..end]).unwrap() {
                        // Only the frame's true end can complete a payload.
                        assert_eq!(end, frame.len());
                        decoded.push(message);
                    }
                    offset = end;
                }
            }

            assert_eq!(decoded, payloads, "fragment size {split}");
        }
    }

    #[test]
    fn reset_discards_partial_input() {
        let mut stream = Compress::new(Compression::default(), true);
        let mut inflater = StreamInflater::new();

        let frame = deflate_payload(&mut stream, r#"{"op":1,"d":null}"#);
        assert_eq!(inflater.extend(&frame[..frame.len() - 3]).unwrap(), None);

        inflater.reset();

        // A fresh stream decodes cleanly after the reset.
        let mut fresh = Compress::new(Compression::default(), true);
        let frame = deflate_payload(&mut fresh, r#"{"op":11}"#);
        assert_eq!(inflater.extend(&frame).unwrap().as_deref(), Some(r#"{"op":11}"#));
    }
}
