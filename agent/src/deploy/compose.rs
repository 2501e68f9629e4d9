//! Compose document materialization
//!
//! Produces the compose file and `.env` file that `compose up` runs from,
//! one directory per app under the stacks directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::StoreError;
use crate::filesys::dir::Dir;
use crate::models::template::TemplateSource;

/// File name of the rendered compose document
pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";

/// File name of the rendered environment file
pub const ENV_FILE_NAME: &str = ".env";

/// `<host>:<container>[/proto]`, optionally list-prefixed and quoted
static PORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*(?:-\s*)?["']?(?P<host>\d{1,5}):\d{1,5}(?:-\d{1,5})?(?:/(?:tcp|udp|sctp))?["']?\s*(?:#.*)?$"#,
    )
    .expect("port pattern is valid")
});

/// What to render
#[derive(Debug, Clone)]
pub struct MaterializeRequest<'a> {
    pub app_id: &'a str,
    pub stack_name: &'a str,
    pub source: &'a TemplateSource,
    pub env: &'a BTreeMap<String, String>,
    pub web_ui_port: Option<u16>,

    /// Restrict the port override to this service's block
    pub primary_service: Option<&'a str>,
}

/// Rendered stack on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedStack {
    pub stack_dir: PathBuf,
    pub compose_path: PathBuf,
    pub env_path: PathBuf,
    pub stack_name: String,

    /// Override if one was applied, else the first published host port found
    pub web_ui_port: Option<u16>,
}

/// Compose materializer
pub struct ComposeMaterializer {
    stacks_dir: Dir,
    client: Client,
}

impl ComposeMaterializer {
    /// Create a materializer writing under `stacks_dir`
    pub fn new(stacks_dir: Dir) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { stacks_dir, client })
    }

    /// Directory holding an app's rendered files
    pub fn stack_dir(&self, app_id: &str) -> Dir {
        self.stacks_dir.subdir(app_id)
    }

    /// Render the compose document and env file for an app.
    ///
    /// Nothing is written if the port override cannot be applied. The two
    /// writes are not atomic as a pair.
    pub async fn materialize(
        &self,
        request: MaterializeRequest<'_>,
    ) -> Result<MaterializedStack, StoreError> {
        info!("Rendering compose stack for app: {}", request.app_id);

        let compose = self.load_compose(request.source).await?;

        let (compose, web_ui_port) = match request.web_ui_port {
            Some(port) => (
                override_web_ui_port(&compose, port, request.primary_service)?,
                Some(port),
            ),
            None => {
                let detected = find_port_line(&compose, request.primary_service)
                    .map(|(_, host)| host);
                (compose, detected)
            }
        };

        let stack_dir = self.stack_dir(request.app_id);
        stack_dir.create().await?;

        let compose_file = stack_dir.file(COMPOSE_FILE_NAME);
        compose_file.write_string(&compose).await?;

        let env_file = stack_dir.file(ENV_FILE_NAME);
        env_file.write_string(&render_env_file(request.env)).await?;

        debug!(
            "Wrote {} and {}",
            compose_file.path().display(),
            env_file.path().display()
        );

        Ok(MaterializedStack {
            stack_dir: stack_dir.path().to_path_buf(),
            compose_path: compose_file.path().to_path_buf(),
            env_path: env_file.path().to_path_buf(),
            stack_name: request.stack_name.to_string(),
            web_ui_port,
        })
    }

    async fn load_compose(&self, source: &TemplateSource) -> Result<String, StoreError> {
        match source {
            TemplateSource::Custom { compose } => Ok(compose.clone()),
            TemplateSource::Catalog {
                repository_url,
                stack_file,
            } => {
                let url = stack_file_url(repository_url, stack_file)?;
                debug!("GET {}", url);

                let response = self.client.get(url.clone()).send().await?;
                if !response.status().is_success() {
                    return Err(StoreError::TemplateError(format!(
                        "Failed to fetch {}: {}",
                        url,
                        response.status()
                    )));
                }
                Ok(response.text().await?)
            }
        }
    }
}

/// URL of a stack file inside a template repository
pub fn stack_file_url(repository_url: &str, stack_file: &str) -> Result<Url, StoreError> {
    let base = Url::parse(&format!("{}/", repository_url.trim_end_matches('/')))?;
    Ok(base.join(stack_file.trim_start_matches('/'))?)
}

/// `KEY=value` lines, sorted by key
pub fn render_env_file(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("{}={}\n", key, quote_env_value(value)))
        .collect()
}

/// Quote a value so compose reads it back unchanged.
///
/// Single quotes disable `$` interpolation and ` #` comments; values holding a
/// single quote are double-quoted with `\`, `"` and `$` escaped.
fn quote_env_value(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-./:@+,=".contains(c));
    if plain {
        return value.to_string();
    }

    if !value.contains('\'') {
        return format!("'{}'", value);
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '$' => quoted.push_str("$$"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Replace the host port of the first published port mapping.
///
/// With a primary service the search is limited to that service's block;
/// if the service key is not in the document the whole text is searched.
pub fn override_web_ui_port(
    compose: &str,
    port: u16,
    primary_service: Option<&str>,
) -> Result<String, StoreError> {
    let (line_index, _) = find_port_line(compose, primary_service).ok_or_else(|| {
        StoreError::TemplateError(
            "Cannot apply web UI port: no published port mapping in compose file".to_string(),
        )
    })?;

    let mut out = String::with_capacity(compose.len() + 8);
    for (index, line) in compose.split_inclusive('\n').enumerate() {
        if index == line_index {
            let content = line.trim_end_matches(['\r', '\n']);
            let ending = &line[content.len()..];
            let host = PORT_LINE
                .captures(content)
                .and_then(|c| c.name("host"))
                .ok_or_else(|| StoreError::TemplateError("Port line changed".to_string()))?;

            out.push_str(&content[..host.start()]);
            out.push_str(&port.to_string());
            out.push_str(&content[host.end()..]);
            out.push_str(ending);
        } else {
            out.push_str(line);
        }
    }

    Ok(out)
}

/// Index and host port of the first published port line
fn find_port_line(compose: &str, primary_service: Option<&str>) -> Option<(usize, u16)> {
    let lines: Vec<&str> = compose.lines().collect();

    let range = match primary_service.and_then(|s| service_block(&lines, s)) {
        Some(range) => range,
        None => {
            if let Some(service) = primary_service {
                warn!("Service '{}' not found in compose file, using first port mapping", service);
            }
            0..lines.len()
        }
    };

    range.into_iter().find_map(|index| {
        PORT_LINE
            .captures(lines[index])
            .and_then(|c| c.name("host"))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .map(|host| (index, host))
    })
}

/// Line range of a service's block, key line excluded
fn service_block(lines: &[&str], service: &str) -> Option<std::ops::Range<usize>> {
    let keys = [
        format!("{}:", service),
        format!("\"{}\":", service),
        format!("'{}':", service),
    ];

    let start = lines.iter().position(|line| {
        let indent = indentation(line);
        indent > 0 && keys.iter().any(|k| line.trim() == k.as_str())
    })?;
    let key_indent = indentation(lines[start]);

    let end = lines[start + 1..]
        .iter()
        .position(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#') && indentation(line) <= key_indent
        })
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());

    Some(start + 1..end)
}

fn indentation(line: &str) -> usize {
    line.len() - line.trim_start().len()
}
