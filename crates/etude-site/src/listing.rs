use crate::names::{encode_file_name, html_escape};
use std::fs;
use std::io;
use std::path::Path;

/// Line of `filelist.html` replaced by the file rows.
pub const FILELIST_MARKER: &str = "<!--filelist_label-->";

/// Names of the regular files in `dir`, sorted.
pub fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn file_row(name: &str) -> String {
    let link = encode_file_name(name);
    format!(
        "            <tr><td class=\"col1\">{}</td> <td class=\"col2\"><a href=\"download_{}\">Download</a></td> <td class=\"col3\"><a href=\"delete_{}\" onclick=\"return confirmDelete();\">Delete</a></td></tr>\n",
        html_escape(name),
        link,
        link
    )
}

/// Expand the template, one row per name in place of the marker line.
pub fn render_listing(template: &str, names: &[String]) -> String {
    let rows: String = names.iter().map(|n| file_row(n)).collect();
    let mut page = String::with_capacity(template.len() + rows.len());
    let mut placed = false;
    for line in template.lines() {
        if !placed && line.trim() == FILELIST_MARKER {
            page.push_str(&rows);
            placed = true;
        } else {
            page.push_str(line);
            page.push('\n');
        }
    }
    if !placed {
        page.push_str(&rows);
    }
    page
}

/// The file-list page for the current contents of `files_dir`.
pub fn listing_page(resources_dir: &Path, files_dir: &Path) -> io::Result<Vec<u8>> {
    let template = fs::read_to_string(resources_dir.join("filelist.html"))?;
    let names = list_files(files_dir)?;
    Ok(render_listing(&template, &names).into_bytes())
}
