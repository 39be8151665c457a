use wiremock::{Request, Respond, ResponseTemplate};

/// Serves a fixed body and honours `Range: bytes=N-` the way a mirror does.
pub struct RangeFile(pub Vec<u8>);

impl Respond for RangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let start = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());

        match start {
            None => ResponseTemplate::new(200).set_body_bytes(self.0.clone()),
            Some(start) if start >= self.0.len() => ResponseTemplate::new(416),
            Some(start) => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {}-{}/{}", start, self.0.len() - 1, self.0.len()).as_str(),
                )
                .set_body_bytes(self.0[start..].to_vec()),
        }
    }
}
