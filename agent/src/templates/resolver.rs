//! Template resolvers
//!
//! Catalog ingestion and custom app parsing happen elsewhere; resolvers only
//! read their normalized output.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::StoreError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::template::AppTemplate;

/// Looks up the template an app is installed from
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    async fn find_template(&self, app_id: &str) -> Result<Option<AppTemplate>, StoreError>;
}

/// Fixed set of templates held in memory
#[derive(Debug, Default, Clone)]
pub struct StaticTemplateResolver {
    templates: HashMap<String, AppTemplate>,
}

impl StaticTemplateResolver {
    pub fn new(templates: impl IntoIterator<Item = AppTemplate>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.app_id.clone(), t))
                .collect(),
        }
    }
}

#[async_trait]
impl TemplateResolver for StaticTemplateResolver {
    async fn find_template(&self, app_id: &str) -> Result<Option<AppTemplate>, StoreError> {
        Ok(self.templates.get(app_id).cloned())
    }
}

/// Templates read from disk on every lookup.
///
/// The catalog file (a JSON array) is searched first, then
/// `<custom_dir>/<app_id>.json`.
#[derive(Debug, Clone)]
pub struct FileTemplateResolver {
    catalog_file: File,
    custom_dir: Dir,
}

impl FileTemplateResolver {
    pub fn new(catalog_file: File, custom_dir: Dir) -> Self {
        Self {
            catalog_file,
            custom_dir,
        }
    }
}

#[async_trait]
impl TemplateResolver for FileTemplateResolver {
    async fn find_template(&self, app_id: &str) -> Result<Option<AppTemplate>, StoreError> {
        let catalog: Vec<AppTemplate> = self.catalog_file.read_json_opt().await?.unwrap_or_default();
        if let Some(template) = catalog.into_iter().find(|t| t.app_id == app_id) {
            return Ok(Some(template));
        }

        if app_id.contains(['/', '\\']) || app_id.starts_with('.') {
            return Ok(None);
        }

        let custom = self.custom_dir.file(&format!("{}.json", app_id));
        let template: Option<AppTemplate> = custom.read_json_opt().await?;
        if template.is_some() {
            debug!("Resolved custom template: {}", app_id);
        }
        Ok(template)
    }
}
