use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use chrono::Utc;
use cwmon_core::jst;
use cwmon_storage::write_atomic;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

pub const DEFAULT_SUBJECT_TEMPLATE: &str = "クラウドワークスで{count}件の新着案件があります";

/// App passwords are 16 characters; anything under this is likely a typo.
const MIN_APP_PASSWORD_LEN: usize = 12;

static ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("address pattern is valid")
});

/// Notification settings, persisted as JSON next to the job store.
///
/// Keys this type does not know about are carried through `extra` so older
/// files keep their content after a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub gmail_address: String,
    pub gmail_app_password: String,
    pub recipient: String,
    pub simulation_mode: bool,
    pub auto_fallback: bool,
    pub subject_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sent: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gmail_address: String::new(),
            gmail_app_password: String::new(),
            recipient: String::new(),
            simulation_mode: true,
            auto_fallback: true,
            subject_template: DEFAULT_SUBJECT_TEMPLATE.to_string(),
            last_sent: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Gmailアドレスを入力してください")]
    MissingAddress,
    #[error("@gmail.comのアドレスを使用してください")]
    NotGmail,
    #[error("メールアドレスの形式が正しくありません")]
    MalformedAddress,
    #[error("Gmailアプリパスワードを入力してください")]
    MissingPassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationWarning {
    #[error("Gmailアプリパスワードが短すぎます。正しいアプリパスワードを確認してください")]
    ShortAppPassword,
}

impl EmailConfig {
    /// Read `path`, creating it with defaults when missing or empty. Unparseable
    /// content is copied to `<path>.bak` and replaced by defaults.
    pub async fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                error!(error = %err, path = %path.display(), "failed to read email config; using defaults");
                return Ok(Self::default());
            }
        };

        if text.trim().is_empty() {
            let config = Self::default();
            config.save(path).await?;
            info!(path = %path.display(), "created default email config");
            return Ok(config);
        }

        match serde_json::from_str::<Self>(&text) {
            Ok(config) => {
                info!(path = %path.display(), enabled = config.enabled, "loaded email config");
                Ok(config)
            }
            Err(err) => {
                error!(error = %err, path = %path.display(), "email config is not valid JSON");
                let backup = backup_path(path);
                match fs::copy(path, &backup).await {
                    Ok(_) => info!(backup = %backup.display(), "backed up invalid email config"),
                    Err(err) => error!(error = %err, "failed to back up invalid email config"),
                }
                let config = Self::default();
                config.save(path).await?;
                Ok(config)
            }
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing email config")?;
        write_atomic(path, &bytes).await
    }

    /// Check the address and app password. A short password is reported as a
    /// warning and does not fail validation.
    pub fn validate(&self) -> Result<Vec<ValidationWarning>, ConfigError> {
        validate_credentials(&self.gmail_address, &self.gmail_app_password)
    }

    /// Where notifications go: the explicit recipient, else the sending address.
    pub fn recipient_address(&self) -> &str {
        let recipient = self.recipient.trim();
        if recipient.is_empty() {
            self.gmail_address.trim()
        } else {
            recipient
        }
    }

    pub fn subject_for(&self, count: usize) -> String {
        let template = if self.subject_template.trim().is_empty() {
            DEFAULT_SUBJECT_TEMPLATE
        } else {
            &self.subject_template
        };
        template.replace("{count}", &count.to_string())
    }

    pub fn mark_sent_now(&mut self) {
        self.last_sent = Some(Utc::now().with_timezone(&jst()).to_rfc3339());
    }
}

pub fn validate_credentials(
    address: &str,
    app_password: &str,
) -> Result<Vec<ValidationWarning>, ConfigError> {
    let address = address.trim();
    if address.is_empty() || !address.contains('@') {
        return Err(ConfigError::MissingAddress);
    }
    if !address.to_lowercase().ends_with("@gmail.com") {
        return Err(ConfigError::NotGmail);
    }
    if !ADDRESS_PATTERN.is_match(address) {
        return Err(ConfigError::MalformedAddress);
    }
    if app_password.is_empty() {
        return Err(ConfigError::MissingPassword);
    }

    let mut warnings = Vec::new();
    if app_password.chars().count() < MIN_APP_PASSWORD_LEN {
        warn!("app password is shorter than expected");
        warnings.push(ValidationWarning::ShortAppPassword);
    }
    Ok(warnings)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}
