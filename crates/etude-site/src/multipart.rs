use memchr::memmem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartError {
    /// A part is not followed by another boundary.
    Incomplete,
    /// Part headers are not UTF-8.
    BadHeaders,
}

#[derive(Debug)]
pub struct Part<'a> {
    pub name: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Iterates the parts of a `multipart/form-data` body.
pub struct Multipart<'a> {
    body: &'a [u8],
    marker: Vec<u8>,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self { body, marker }
    }

    /// First part that carries a non-empty filename.
    pub fn first_file(self) -> Option<Part<'a>> {
        self.filter_map(Result::ok)
            .find(|p| p.filename.is_some_and(|f| !f.is_empty()))
    }
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Result<Part<'a>, MultipartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }

        let mut start = memmem::find(self.body, &self.marker)? + self.marker.len();

        // `--boundary--` closes the body.
        if self.body[start..].starts_with(b"--") {
            self.body = &[];
            return None;
        }
        if self.body[start..].starts_with(b"\r\n") {
            start += 2;
        }

        let Some(header_end) = memmem::find(&self.body[start..], b"\r\n\r\n") else {
            self.body = &[];
            return Some(Err(MultipartError::Incomplete));
        };
        let header_slice = &self.body[start..start + header_end];
        let body_start = start + header_end + 4;

        let Some(next) = memmem::find(&self.body[body_start..], &self.marker) else {
            self.body = &[];
            return Some(Err(MultipartError::Incomplete));
        };
        let body_end = body_start + next;

        // The CRLF before a boundary belongs to the delimiter.
        let content_end = if self.body[body_start..body_end].ends_with(b"\r\n") {
            body_end - 2
        } else {
            body_end
        };
        let content = &self.body[body_start..content_end];
        self.body = &self.body[body_end..];

        let Ok(headers) = std::str::from_utf8(header_slice) else {
            return Some(Err(MultipartError::BadHeaders));
        };

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').skip(1) {
                    let Some((k, v)) = param.trim().split_once('=') else {
                        continue;
                    };
                    let v = v.trim().trim_matches('"');
                    match k.trim() {
                        k if k.eq_ignore_ascii_case("name") => name = Some(v),
                        k if k.eq_ignore_ascii_case("filename") => filename = Some(v),
                        _ => {}
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim());
            }
        }

        Some(Ok(Part {
            name,
            filename,
            content_type,
            body: content,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"------WebKitFormBoundaryX\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\r\n\
hello\r\n\
------WebKitFormBoundaryX\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"report.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
line one\r\nline two\r\n\
------WebKitFormBoundaryX--\r\n";

    #[test]
    fn parts_are_split_on_the_boundary() {
        let parts: Vec<_> = Multipart::new(BODY, "----WebKitFormBoundaryX")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, Some("note"));
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].body, b"hello");
        assert_eq!(parts[1].filename, Some("report.txt"));
        assert_eq!(parts[1].content_type, Some("text/plain"));
        // Inner CRLFs are content; only the one before the boundary is not.
        assert_eq!(parts[1].body, b"line one\r\nline two");
    }

    #[test]
    fn first_file_skips_plain_fields() {
        let part = Multipart::new(BODY, "----WebKitFormBoundaryX")
            .first_file()
            .unwrap();
        assert_eq!(part.filename, Some("report.txt"));
    }

    #[test]
    fn missing_closing_boundary_is_incomplete() {
        let body = b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a\"\r\n\r\nabc";
        let mut parts = Multipart::new(body, "b");
        assert!(matches!(parts.next(), Some(Err(MultipartError::Incomplete))));
        assert!(parts.next().is_none());
    }
}
