use serde_json::Value;

/// Scans SSE bytes as they pass through the Admission Front, capturing the
/// last `data:` frame that carries a `usage` field (the penultimate frame,
/// per the upstream's framing convention, before the terminal
/// `data: [DONE]`). Tolerant of chunk boundaries splitting a line.
#[derive(Default)]
pub struct UsageSniffer {
    buffer: String,
    last_usage_frame: Option<Value>,
}

impl UsageSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a raw chunk of upstream bytes. Non-UTF8 chunks are ignored for
    /// sniffing purposes only; the bytes themselves are still forwarded to
    /// the client unchanged by the caller.
    pub fn feed(&mut self, chunk: &[u8]) {
        let Ok(text) = std::str::from_utf8(chunk) else { return };
        self.buffer.push_str(text);

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            self.observe_line(line);
        }
    }

    fn observe_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else { return };
        let data = data.trim();
        if data == "[DONE]" {
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(data) {
            if value.get("usage").is_some() {
                self.last_usage_frame = Some(value);
            }
        }
    }

    /// Consumes the sniffer, returning the captured usage-bearing frame, if
    /// any was observed before stream end.
    pub fn into_response_body(self) -> Option<Value> {
        self.last_usage_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_last_frame_with_usage_before_done() {
        let mut sniffer = UsageSniffer::new();
        sniffer.feed(b"data: {\"choices\":[]}\n\n");
        sniffer.feed(
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":4,\"total_tokens\":7}}\n\n",
        );
        sniffer.feed(b"data: [DONE]\n\n");
        let body = sniffer.into_response_body().unwrap();
        assert_eq!(body["usage"]["total_tokens"], 7);
    }

    #[test]
    fn handles_frame_split_across_chunks() {
        let mut sniffer = UsageSniffer::new();
        sniffer.feed(b"data: {\"usage\":{\"total");
        sniffer.feed(b"_tokens\":12}}\n\n");
        let body = sniffer.into_response_body().unwrap();
        assert_eq!(body["usage"]["total_tokens"], 12);
    }

    #[test]
    fn no_usage_frame_yields_none() {
        let mut sniffer = UsageSniffer::new();
        sniffer.feed(b"data: {\"choices\":[]}\n\n");
        sniffer.feed(b"data: [DONE]\n\n");
        assert!(sniffer.into_response_body().is_none());
    }
}
