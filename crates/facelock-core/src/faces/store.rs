use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::faces::extractor::FeatureVector;
use crate::protect::{ProtectError, Protector};

const FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no template file at {path}")]
    NotFound { path: PathBuf },

    #[error("template file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("template file {path} could not be unsealed: {source}")]
    Protection {
        path: PathBuf,
        #[source]
        source: ProtectError,
    },

    #[error("failed to read template file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write template file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize templates: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    /// Pose instruction or image file that produced the template.
    pub source: String,
    pub created_at: String,
    pub features: FeatureVector,
}

impl Template {
    pub fn new(source: impl Into<String>, features: FeatureVector) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            features,
        }
    }
}

/// Ordered, non-empty templates of one identity, all of the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSet {
    templates: Vec<Template>,
}

impl TemplateSet {
    pub fn new(templates: Vec<Template>) -> AppResult<Self> {
        let Some(first) = templates.first() else {
            return Err(AppError::Precondition(
                "a template set needs at least one template".into(),
            ));
        };
        let expected = first.features.len();
        if expected == 0 {
            return Err(AppError::Precondition("templates must not be empty".into()));
        }
        if let Some((index, template)) = templates
            .iter()
            .enumerate()
            .find(|(_, template)| template.features.len() != expected)
        {
            return Err(AppError::Precondition(format!(
                "template {index} has {} values, expected {expected}",
                template.features.len()
            )));
        }
        Ok(Self { templates })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn feature_len(&self) -> usize {
        self.templates[0].features.len()
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn features(&self) -> impl Iterator<Item = &FeatureVector> {
        self.templates.iter().map(|template| &template.features)
    }
}

#[derive(Serialize, Deserialize)]
struct TemplateFile {
    version: u32,
    feature_len: usize,
    templates: Vec<Template>,
}

pub trait TemplateStore {
    fn load(&self) -> Result<TemplateSet, StoreError>;
    fn save(&self, templates: &TemplateSet) -> Result<(), StoreError>;
    fn location(&self) -> &Path;
}

/// Single template file whose payload passes through a [`Protector`].
pub struct FileTemplateStore<P> {
    path: PathBuf,
    protector: P,
}

impl<P: Protector> FileTemplateStore<P> {
    pub fn new(path: impl Into<PathBuf>, protector: P) -> Self {
        Self {
            path: path.into(),
            protector,
        }
    }

    fn corrupt(&self, message: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            message: message.into(),
        }
    }

    fn decode(&self, plaintext: &[u8]) -> Result<TemplateSet, StoreError> {
        let file: TemplateFile = serde_json::from_slice(plaintext)
            .map_err(|err| self.corrupt(format!("invalid template data: {err}")))?;

        if file.version != FILE_VERSION {
            return Err(self.corrupt(format!("unsupported version {}", file.version)));
        }
        if file.templates.is_empty() {
            return Err(self.corrupt("contains no templates"));
        }
        if file.feature_len == 0 {
            return Err(self.corrupt("feature length is zero"));
        }
        for (index, template) in file.templates.iter().enumerate() {
            if template.features.len() != file.feature_len {
                return Err(self.corrupt(format!(
                    "template {index} has {} values, expected {}",
                    template.features.len(),
                    file.feature_len
                )));
            }
            if template
                .features
                .values()
                .iter()
                .any(|value| !value.is_finite() || !(0.0..=1.0).contains(value))
            {
                return Err(self.corrupt(format!("template {index} has values outside [0, 1]")));
            }
        }

        TemplateSet::new(file.templates).map_err(|err| self.corrupt(err.to_string()))
    }
}

impl<P: Protector> TemplateStore for FileTemplateStore<P> {
    fn load(&self) -> Result<TemplateSet, StoreError> {
        let payload = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    path: self.path.clone(),
                })
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let plaintext = match self.protector.unprotect(&payload) {
            Ok(plaintext) => plaintext,
            Err(ProtectError::Unsupported(reason)) => {
                warn!(
                    path = %self.path.display(),
                    protector = self.protector.name(),
                    %reason,
                    "template payload not sealed; parsing raw contents"
                );
                payload
            }
            Err(source) => {
                return Err(StoreError::Protection {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let set = self.decode(&plaintext)?;
        debug!(path = %self.path.display(), templates = set.len(), "loaded face templates");
        Ok(set)
    }

    fn save(&self, templates: &TemplateSet) -> Result<(), StoreError> {
        let file = TemplateFile {
            version: FILE_VERSION,
            feature_len: templates.feature_len(),
            templates: templates.templates().to_vec(),
        };
        let plaintext = serde_json::to_vec(&file)?;
        let payload = self
            .protector
            .protect(&plaintext)
            .map_err(|source| StoreError::Protection {
                path: self.path.clone(),
                source,
            })?;

        write_atomically(&self.path, |writer| writer.write_all(&payload))?;
        debug!(
            path = %self.path.display(),
            templates = templates.len(),
            protector = self.protector.name(),
            "saved face templates"
        );
        Ok(())
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

/// Writes through a temp file in the target directory and renames it into
/// place, so readers only ever observe the old or the new contents.
fn write_atomically<F>(path: &Path, fill: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let write_error = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_error)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_error)?;
    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            fill(&mut writer).map_err(write_error)?;
            writer.flush().map_err(write_error)?;
        }
        file.sync_all().map_err(write_error)?;
    }

    let file = tmp.persist(path).map_err(|err| write_error(err.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(write_error)?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).map_err(write_error)?;
    }
    #[cfg(not(unix))]
    drop(file);

    Ok(())
}
