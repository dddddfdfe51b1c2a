use etude_core::Status;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

/// Characters escaped when a stored name is put into a link.
const LINK: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Decode the file name carried in a `/download_<name>` or `/delete_<name>`
/// target.
///
/// The result is always a single path component: anything that could reach
/// outside the upload directory is refused with 403, undecodable bytes with
/// 400.
pub fn decode_file_name(raw: &str) -> Result<String, Status> {
    let name = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| Status::BadRequest)?;
    check_file_name(&name)?;
    Ok(name.into_owned())
}

/// Accept only names that are one plain component of the upload directory.
pub fn check_file_name(name: &str) -> Result<(), Status> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(Status::Forbidden);
    }
    Ok(())
}

/// Escape a stored file name for use inside an `href`.
pub fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, LINK).to_string()
}

/// Escape text for an HTML text node.
pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_any_utf8_not_just_three_byte_runs() {
        assert_eq!(decode_file_name("a%20b.txt").unwrap(), "a b.txt");
        assert_eq!(decode_file_name("%E4%BD%A0%E5%A5%BD.md").unwrap(), "你好.md");
        assert_eq!(decode_file_name("caf%C3%A9").unwrap(), "café");
        assert_eq!(decode_file_name("plain.bin").unwrap(), "plain.bin");
    }

    #[test]
    fn escapes_out_of_the_directory_are_forbidden() {
        assert_eq!(decode_file_name(".."), Err(Status::Forbidden));
        assert_eq!(decode_file_name("%2E%2E"), Err(Status::Forbidden));
        assert_eq!(decode_file_name("..%2Fetc%2Fpasswd"), Err(Status::Forbidden));
        assert_eq!(decode_file_name("a%00b"), Err(Status::Forbidden));
        assert_eq!(decode_file_name(""), Err(Status::Forbidden));
    }

    #[test]
    fn invalid_utf8_is_bad_request() {
        assert_eq!(decode_file_name("%FF%FE"), Err(Status::BadRequest));
    }

    #[test]
    fn link_encoding_round_trips() {
        let name = "my report #1.txt";
        let encoded = encode_file_name(name);
        assert_eq!(encoded, "my%20report%20%231.txt");
        assert_eq!(decode_file_name(&encoded).unwrap(), name);
        assert_eq!(html_escape("<a&b>"), "&lt;a&amp;b&gt;");
    }
}
