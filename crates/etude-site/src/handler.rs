//! Request routing for the file-sharing site.
//!
//! | request | response |
//! |---|---|
//! | `GET /download_<name>` | the stored file, as an attachment |
//! | `GET /delete_<name>` | removes the file, then the file list |
//! | `GET /error.html` | 404 |
//! | `GET /`, `/filelist.html`, `/file.html`, `/fileitem.html` | the login page |
//! | `GET <other>` | the page under the resources directory |
//! | `POST /upload` | stores the first uploaded file, then the file list |
//! | `POST /register.html` | registers, then the login page |
//! | `POST <other>` | logs in, then the file list |
//!
//! Failed logins and registrations get `error.html`.

use crate::config::SiteConfig;
use crate::error::SiteResult;
use crate::listing::listing_page;
use crate::multipart::Multipart;
use crate::names::{check_file_name, decode_file_name};
use crate::store::UserStore;
use etude_core::{Handler, Method, Request, ResponseIntent, StaticFiles, Status};
use serde::Deserialize;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Pages that are only reachable after logging in.
const LOGIN_GATED: [&str; 4] = ["/", "/filelist.html", "/file.html", "/fileitem.html"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Credentials {
    username: String,
    password: String,
}

pub struct SiteHandler {
    pages: StaticFiles,
    files_dir: PathBuf,
    users: UserStore,
}

impl SiteHandler {
    /// Open the user store and make sure the upload directory exists.
    pub fn new(config: &SiteConfig) -> SiteResult<Self> {
        fs::create_dir_all(&config.files_dir)?;
        let users = UserStore::open(&config.users_file, config.store_pool_size)?;
        Ok(Self {
            pages: StaticFiles::new(&config.resources_dir),
            files_dir: config.files_dir.clone(),
            users,
        })
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    fn page(&self, name: &str) -> ResponseIntent {
        ResponseIntent::file(self.pages.root().join(name))
    }

    fn file_list(&self) -> ResponseIntent {
        match listing_page(self.pages.root(), &self.files_dir) {
            Ok(html) => ResponseIntent::html(html),
            Err(e) => {
                error!("failed to build file list: {}", e);
                ResponseIntent::error(Status::InternalError)
            }
        }
    }

    fn get(&self, path: &str) -> ResponseIntent {
        if let Some(raw) = strip_prefix_ignore_case(path, "/download_") {
            return match decode_file_name(raw) {
                Ok(name) => ResponseIntent::download(self.files_dir.join(name)),
                Err(status) => ResponseIntent::error(status),
            };
        }
        if let Some(raw) = strip_prefix_ignore_case(path, "/delete_") {
            let name = match decode_file_name(raw) {
                Ok(name) => name,
                Err(status) => return ResponseIntent::error(status),
            };
            match fs::remove_file(self.files_dir.join(&name)) {
                Ok(()) => info!(file = %name, "file deleted"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => debug!(file = %name, "nothing to delete"),
                Err(e) => warn!(file = %name, "delete failed: {}", e),
            }
            return self.file_list();
        }
        if path.eq_ignore_ascii_case("/error.html") {
            return ResponseIntent::error(Status::NotFound);
        }
        if LOGIN_GATED.iter().any(|p| path.eq_ignore_ascii_case(p)) {
            return self.page("login.html");
        }
        match self.pages.resolve(path) {
            Some(file) => ResponseIntent::file(file),
            None => ResponseIntent::error(Status::BadRequest),
        }
    }

    fn upload(&self, req: &Request<'_>) -> ResponseIntent {
        let Some(boundary) = req.boundary() else {
            debug!("upload without a multipart boundary");
            return self.file_list();
        };
        let Some(part) = Multipart::new(req.body, boundary).first_file() else {
            debug!("upload without a file part");
            return self.file_list();
        };
        let name = part.filename.unwrap_or_default();
        if let Err(status) = check_file_name(name) {
            warn!(file = name, "refusing upload name");
            return ResponseIntent::error(status);
        }
        let dest = self.files_dir.join(name);
        // Downloads are only served for world-readable files.
        let stored = fs::write(&dest, part.body)
            .and_then(|()| fs::set_permissions(&dest, fs::Permissions::from_mode(0o644)));
        if let Err(e) = stored {
            error!(file = name, "failed to store upload: {}", e);
            return ResponseIntent::error(Status::InternalError);
        }
        info!(file = name, bytes = part.body.len(), "file uploaded");
        self.file_list()
    }

    fn sign_in(&self, req: &Request<'_>) -> ResponseIntent {
        let login = !req.path.eq_ignore_ascii_case("/register.html");
        let creds: Credentials = serde_urlencoded::from_bytes(req.body).unwrap_or_default();
        match self.users.verify(&creds.username, &creds.password, login) {
            Ok(true) if login => {
                info!(user = %creds.username, "login");
                self.file_list()
            }
            Ok(true) => {
                info!(user = %creds.username, "registered");
                self.page("login.html")
            }
            Ok(false) => {
                debug!(user = %creds.username, login, "verification failed");
                self.page("error.html")
            }
            Err(e) => {
                error!("user store failed: {}", e);
                ResponseIntent::error(Status::InternalError)
            }
        }
    }
}

impl Handler for SiteHandler {
    fn handle(&self, req: &Request<'_>) -> ResponseIntent {
        match req.method {
            Method::Get => self.get(req.path),
            Method::Post if req.path.eq_ignore_ascii_case("/upload") => self.upload(req),
            Method::Post => self.sign_in(req),
        }
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}
