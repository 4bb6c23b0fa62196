//! API endpoint URL builders

fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

pub fn health_url(base_url: &str) -> String {
    format!("{}/health", base_url)
}

/// Tracking snapshot of one key, optionally with manifest entries.
pub fn load_status_url(base_url: &str, database: &str, table: &str, expand_files: bool) -> String {
    let mut url = format!(
        "{}/api/v1/loads/{}/{}",
        base_url,
        segment(database),
        segment(table)
    );
    if expand_files {
        url.push_str("?expand=files");
    }
    url
}

pub fn complete_url(base_url: &str, database: &str, table: &str) -> String {
    format!(
        "{}/api/v1/loads/{}/{}/complete",
        base_url,
        segment(database),
        segment(table)
    )
}

pub fn pending_url(base_url: &str, database: &str, table: &str) -> String {
    format!(
        "{}/api/v1/loads/{}/{}/pending",
        base_url,
        segment(database),
        segment(table)
    )
}

pub fn bulk_loads_url(base_url: &str) -> String {
    format!("{}/api/v1/bulk-loads", base_url)
}
