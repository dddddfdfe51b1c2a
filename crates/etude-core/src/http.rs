// src/http.rs
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Methods are matched case-insensitively; anything but GET and POST is refused.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if b.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"HTTP/1.1") {
            Some(Version::Http11)
        } else if b.eq_ignore_ascii_case(b"HTTP/1.0") {
            Some(Version::Http10)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed body text sent with an error status.
    pub fn form(&self) -> &'static str {
        match self {
            Status::Ok => "",
            Status::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => "You do not have permission to get file from this server.\n",
            Status::NotFound => "The requested file was not found on this server.\n",
            Status::InternalError => "There was an unusual problem serving the requested file.\n",
        }
    }

    /// `"<code>,<form>"`, the body of a response that carries no content of its own.
    pub fn error_body(&self) -> Vec<u8> {
        format!("{},{}", self.code(), self.form()).into_bytes()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// A fully received request, borrowed from the connection's parser and read buffer.
///
/// Header names are stored lowercased.
#[derive(Debug)]
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub version: Version,
    pub headers: &'a HashMap<String, String>,
    pub body: &'a [u8],
    pub keep_alive: bool,
}

impl<'a> Request<'a> {
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// Media type without parameters, e.g. `multipart/form-data`.
    pub fn content_type(&self) -> Option<&'a str> {
        self.header("content-type")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    /// `boundary` parameter of a multipart content type.
    pub fn boundary(&self) -> Option<&'a str> {
        let value = self.header("content-type")?;
        value.split(';').skip(1).find_map(|param| {
            let (key, val) = param.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| val.trim().trim_matches('"'))
        })
    }
}

/// What the collaborator wants sent back.
///
/// A `file` is resolved by the engine (existence, permission and directory
/// checks) and sent zero-copy; a `body` is sent from memory. With neither,
/// an error status gets its fixed error text and a success gets an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseIntent {
    pub status: Status,
    pub file: Option<PathBuf>,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub download: bool,
}

impl ResponseIntent {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            status: Status::Ok,
            file: Some(path.into()),
            body: None,
            content_type: None,
            download: false,
        }
    }

    /// Send a file with `Content-Disposition: attachment`.
    pub fn download(path: impl Into<PathBuf>) -> Self {
        Self {
            download: true,
            ..Self::file(path)
        }
    }

    pub fn body(status: Status, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            file: None,
            body: Some(body.into()),
            content_type: None,
            download: false,
        }
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Self::body(Status::Ok, body).with_content_type("text/html")
    }

    pub fn error(status: Status) -> Self {
        Self {
            status,
            file: None,
            body: None,
            content_type: None,
            download: false,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Content type guessed from a file extension.
pub fn mime_for(path: &std::path::Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
