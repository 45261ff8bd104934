//! Email notification of new listings over Gmail SMTP, with a simulation mode
//! that only logs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use async_trait::async_trait;
use cwmon_core::Listing;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use thiserror::Error;
use tracing::{error, info, warn};

mod config;

pub use lettre::Message;

pub use config::{
    validate_credentials, ConfigError, EmailConfig, ValidationWarning, DEFAULT_SUBJECT_TEMPLATE,
};

pub const CRATE_NAME: &str = "cwmon-notify";

pub const SMTP_HOST: &str = "smtp.gmail.com";

/// Listings written into one notification before the remainder is summarized.
pub const MAX_LISTED: usize = 10;

const FALLBACK_SUBJECT: &str = "クラウドワークス新着案件のお知らせ";
pub const TEST_SUBJECT: &str = "クラウドワークス新着案件モニター - テストメール";

pub const APP_PASSWORD_INSTRUCTIONS: &str = "\
【Gmailアプリパスワードの取得方法】
1. https://myaccount.google.com/security にアクセス
2. 「2段階認証プロセス」を有効にする
3. 下にスクロールして「アプリパスワード」を選択
4. アプリ名に「CrowdWorks Monitor」と入力して作成
5. 生成された16文字のパスワードをコピーして入力する

※スペースなしの16文字のパスワードをそのまま入力してください
※通常のGoogleアカウントのパスワードは使用できません";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("rendering message body: {0}")]
    Render(#[from] askama::Error),
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// How a send attempt ended. Sending failures are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Simulated {
        recipient: String,
    },
    Sent {
        recipient: String,
    },
    /// Delivery failed and the config was switched to simulation mode.
    SimulatedAfterFallback {
        recipient: String,
        error: String,
        advice: Option<String>,
    },
    Failed {
        error: String,
        advice: Option<String>,
    },
}

impl NotifyOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, NotifyOutcome::Failed { .. })
    }

    /// One-line message for the UI.
    pub fn summary(&self) -> String {
        match self {
            NotifyOutcome::Simulated { recipient } => {
                format!("【シミュレーション】メール送信をシミュレートしました: {recipient}")
            }
            NotifyOutcome::Sent { recipient } => format!("メールを{recipient}に送信しました"),
            NotifyOutcome::SimulatedAfterFallback { .. } => {
                "送信エラーのため、自動的にシミュレーションモードに切り替えました".to_string()
            }
            NotifyOutcome::Failed { error, .. } => format!("メール送信に失敗しました: {error}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpMode {
    /// TLS from the first byte, port 465.
    ImplicitTls,
    /// Plain connect upgraded with STARTTLS, port 587.
    StartTls,
}

#[derive(Clone)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("SMTP authentication failed: {0}")]
    Auth(String),
    #[error("SMTP delivery failed: {0}")]
    Delivery(String),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }

    fn from_smtp(err: &lettre::transport::smtp::Error) -> Self {
        let text = err.to_string();
        let auth = err.is_permanent()
            && (text.contains("535")
                || text.contains("534")
                || text.contains("Username and Password not accepted")
                || text.contains("Application-specific password required"));
        if auth {
            TransportError::Auth(text)
        } else {
            TransportError::Delivery(text)
        }
    }

    /// Troubleshooting text for authentication failures.
    pub fn advice(&self) -> Option<String> {
        let TransportError::Auth(detail) = self else {
            return None;
        };
        let advice = if detail.contains("Application-specific password required") {
            format!(
                "Gmailの2段階認証で保護されたアカウントには「アプリパスワード」が必要です。\n\n{APP_PASSWORD_INSTRUCTIONS}"
            )
        } else if detail.contains("Username and Password not accepted") {
            "Gmailのユーザー名またはパスワードが正しくありません。\n\n\
             1. Gmailアドレスを正確に入力しているか確認してください\n\
             2. アプリパスワードが正しいか確認してください\n\
             3. パスワードを手動で再入力してみてください（コピペではなく）\n\
             4. Googleアカウントにログインし、セキュリティに問題がないか確認してください\n\n\
             ※通常のパスワードではなく、「アプリパスワード」を使用してください"
                .to_string()
        } else {
            format!(
                "Gmailの認証に失敗しました。以下を確認してください。\n\n\
                 1. Gmailアドレスが正しく入力されているか\n\
                 2. Googleアカウントで2段階認証が有効になっているか\n\
                 3. アプリパスワードが正しいか（16文字、スペースなし）\n\n\
                 ※エラーの詳細: {detail}"
            )
        };
        Some(advice)
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(
        &self,
        mode: SmtpMode,
        credentials: &SmtpCredentials,
        message: Message,
    ) -> Result<(), TransportError>;
}

/// lettre-backed SMTP delivery.
#[derive(Debug, Clone)]
pub struct SmtpMailTransport {
    host: String,
    timeout: Duration,
}

impl Default for SmtpMailTransport {
    fn default() -> Self {
        Self::new(SMTP_HOST, Duration::from_secs(30))
    }
}

impl SmtpMailTransport {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn deliver(
        &self,
        mode: SmtpMode,
        credentials: &SmtpCredentials,
        message: Message,
    ) -> Result<(), TransportError> {
        let builder = match mode {
            SmtpMode::ImplicitTls => AsyncSmtpTransport::<Tokio1Executor>::relay(&self.host),
            SmtpMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host),
        }
        .map_err(|e| TransportError::from_smtp(&e))?;

        let transport = builder
            .credentials(Credentials::new(
                credentials.username.clone(),
                credentials.password.clone(),
            ))
            .timeout(Some(self.timeout))
            .build();

        transport
            .send(message)
            .await
            .map_err(|e| TransportError::from_smtp(&e))?;
        Ok(())
    }
}

/// Subject plus plain-text and HTML bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl ComposedMail {
    pub fn to_message(&self, from: &str, to: &str) -> Result<Message, NotifyError> {
        let from: Mailbox = from.parse()?;
        let to: Mailbox = to.parse()?;
        let subject = if self.subject.trim().is_empty() {
            FALLBACK_SUBJECT
        } else {
            &self.subject
        };
        Ok(Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(
                self.text.clone(),
                self.html.clone(),
            ))?)
    }
}

struct EmailRow {
    n: usize,
    title: String,
    url: String,
    payment: String,
}

#[derive(Template)]
#[template(path = "new_listings_email.txt")]
struct NewListingsText<'a> {
    total: usize,
    rows: &'a [EmailRow],
    remaining: usize,
}

#[derive(Template)]
#[template(path = "new_listings_email.html")]
struct NewListingsHtml<'a> {
    total: usize,
    rows: &'a [EmailRow],
    remaining: usize,
}

#[derive(Template)]
#[template(path = "test_email.html")]
struct TestEmailHtml<'a> {
    subject: &'a str,
}

/// First [`MAX_LISTED`] listings as rows, the remainder counted.
pub fn compose_new_listings(subject: &str, listings: &[Listing]) -> Result<ComposedMail, NotifyError> {
    let total = listings.len();
    let rows: Vec<EmailRow> = listings
        .iter()
        .take(MAX_LISTED)
        .enumerate()
        .map(|(i, listing)| EmailRow {
            n: i + 1,
            title: if listing.title.is_empty() {
                "タイトルなし".to_string()
            } else {
                listing.title.clone()
            },
            url: if listing.url.is_empty() {
                "#".to_string()
            } else {
                listing.url.clone()
            },
            payment: listing.payment_info.display_text(),
        })
        .collect();
    let remaining = total.saturating_sub(MAX_LISTED);

    Ok(ComposedMail {
        subject: subject.to_string(),
        text: NewListingsText { total, rows: &rows, remaining }.render()?,
        html: NewListingsHtml { total, rows: &rows, remaining }.render()?,
    })
}

pub fn compose_test() -> Result<ComposedMail, NotifyError> {
    Ok(ComposedMail {
        subject: TEST_SUBJECT.to_string(),
        text: "これはテストメールです。クラウドワークス新着案件モニターからのメール通知が正常に機能しています。\n".to_string(),
        html: TestEmailHtml { subject: TEST_SUBJECT }.render()?,
    })
}

/// Owns the email config file and performs sends through a [`MailTransport`].
pub struct Notifier {
    path: PathBuf,
    config: EmailConfig,
    transport: Arc<dyn MailTransport>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("path", &self.path)
            .field("enabled", &self.config.enabled)
            .field("simulation_mode", &self.config.simulation_mode)
            .finish()
    }
}

impl Notifier {
    pub async fn load(
        path: impl Into<PathBuf>,
        transport: Arc<dyn MailTransport>,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        let config = EmailConfig::load_or_init(&path).await?;
        Ok(Self {
            path,
            config,
            transport,
        })
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    /// Enabled with an address on file; the gate for new-listing mail.
    pub fn is_configured(&self) -> bool {
        self.config.enabled && !self.config.gmail_address.trim().is_empty()
    }

    /// Validate and store credentials, enabling notifications. The address is
    /// used as both sender and recipient.
    pub async fn save_credentials(
        &mut self,
        address: &str,
        app_password: &str,
    ) -> Result<Vec<ValidationWarning>, NotifyError> {
        let warnings = validate_credentials(address, app_password)?;
        let address = address.trim().to_string();
        self.config.enabled = true;
        self.config.gmail_address = address.clone();
        self.config.recipient = address;
        self.config.gmail_app_password = app_password.to_string();
        if self.config.subject_template.trim().is_empty() {
            self.config.subject_template = DEFAULT_SUBJECT_TEMPLATE.to_string();
        }
        self.config.save(&self.path).await?;
        info!(simulation_mode = self.config.simulation_mode, "saved email settings");
        Ok(warnings)
    }

    pub async fn set_enabled(&mut self, enabled: bool) -> Result<(), NotifyError> {
        self.config.enabled = enabled;
        self.config.save(&self.path).await?;
        Ok(())
    }

    pub async fn set_simulation_mode(&mut self, on: bool) -> Result<(), NotifyError> {
        self.config.simulation_mode = on;
        self.config.save(&self.path).await?;
        info!(simulation_mode = on, "updated simulation mode");
        Ok(())
    }

    pub async fn set_auto_fallback(&mut self, on: bool) -> Result<(), NotifyError> {
        self.config.auto_fallback = on;
        self.config.save(&self.path).await?;
        info!(auto_fallback = on, "updated auto fallback");
        Ok(())
    }

    /// Summarize `listings` in one message with the configured subject template.
    pub async fn notify_new_listings(
        &mut self,
        listings: &[Listing],
    ) -> Result<NotifyOutcome, NotifyError> {
        let pending = self.prepare_new_listings(listings)?;
        self.send_pending(pending).await
    }

    pub async fn send_test(&mut self) -> Result<NotifyOutcome, NotifyError> {
        let pending = self.prepare_test()?;
        self.send_pending(pending).await
    }

    /// Deliver `mail`, honoring simulation mode and auto fallback. Non-test
    /// sends that succeed (really or simulated) stamp `last_sent`.
    pub async fn send(
        &mut self,
        mail: ComposedMail,
        is_test: bool,
    ) -> Result<NotifyOutcome, NotifyError> {
        let pending = self.prepare(mail, is_test)?;
        self.send_pending(pending).await
    }

    async fn send_pending(&mut self, pending: PendingSend) -> Result<NotifyOutcome, NotifyError> {
        let delivery = pending.deliver().await;
        Ok(self.record(delivery).await)
    }

    pub fn prepare_new_listings(&self, listings: &[Listing]) -> Result<PendingSend, NotifyError> {
        let subject = self.config.subject_for(listings.len());
        self.prepare(compose_new_listings(&subject, listings)?, false)
    }

    pub fn prepare_test(&self) -> Result<PendingSend, NotifyError> {
        self.prepare(compose_test()?, true)
    }

    /// Validate the settings and snapshot what delivery needs, so the caller
    /// can release the notifier while the SMTP exchange runs.
    pub fn prepare(&self, mail: ComposedMail, is_test: bool) -> Result<PendingSend, NotifyError> {
        for warning in self.config.validate()? {
            warn!(%warning, "email settings warning");
        }
        let recipient = self.config.recipient_address().to_string();
        let message = if self.config.simulation_mode {
            None
        } else {
            Some(mail.to_message(self.config.gmail_address.trim(), &recipient)?)
        };
        Ok(PendingSend {
            subject: mail.subject,
            recipient,
            is_test,
            message,
            credentials: SmtpCredentials {
                username: self.config.gmail_address.trim().to_string(),
                password: self.config.gmail_app_password.clone(),
            },
            transport: self.transport.clone(),
        })
    }

    /// Apply a finished delivery: stamp `last_sent`, or switch to simulation
    /// mode when delivery failed and auto fallback is on.
    pub async fn record(&mut self, delivery: Delivery) -> NotifyOutcome {
        let Delivery {
            recipient,
            is_test,
            result,
        } = delivery;
        match result {
            DeliveryResult::Simulated => {
                if !is_test {
                    self.stamp_last_sent().await;
                }
                NotifyOutcome::Simulated { recipient }
            }
            DeliveryResult::Sent => {
                if !is_test {
                    self.stamp_last_sent().await;
                }
                NotifyOutcome::Sent { recipient }
            }
            DeliveryResult::Failed(err) => {
                let advice = err.advice();
                if !self.config.auto_fallback {
                    return NotifyOutcome::Failed {
                        error: err.to_string(),
                        advice,
                    };
                }
                self.config.simulation_mode = true;
                if !is_test {
                    self.config.mark_sent_now();
                }
                if let Err(save_err) = self.config.save(&self.path).await {
                    error!(error = %save_err, "failed to persist simulation fallback");
                }
                info!(%recipient, "switched to simulation mode after delivery failure");
                NotifyOutcome::SimulatedAfterFallback {
                    recipient,
                    error: err.to_string(),
                    advice,
                }
            }
        }
    }

    async fn stamp_last_sent(&mut self) {
        self.config.mark_sent_now();
        if let Err(err) = self.config.save(&self.path).await {
            error!(error = %err, "failed to persist last_sent");
        }
    }
}

/// A validated send, detached from the [`Notifier`].
pub struct PendingSend {
    subject: String,
    recipient: String,
    is_test: bool,
    /// `None` in simulation mode.
    message: Option<Message>,
    credentials: SmtpCredentials,
    transport: Arc<dyn MailTransport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Simulated,
    Sent,
    Failed(TransportError),
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub recipient: String,
    pub is_test: bool,
    pub result: DeliveryResult,
}

impl PendingSend {
    /// Implicit TLS first; a non-auth failure gets one STARTTLS retry.
    pub async fn deliver(self) -> Delivery {
        let PendingSend {
            subject,
            recipient,
            is_test,
            message,
            credentials,
            transport,
        } = self;

        let Some(message) = message else {
            info!(%recipient, %subject, is_test, "simulated email send");
            return Delivery {
                recipient,
                is_test,
                result: DeliveryResult::Simulated,
            };
        };

        let attempt = match transport
            .deliver(SmtpMode::ImplicitTls, &credentials, message.clone())
            .await
        {
            Err(err) if !err.is_auth() => {
                warn!(error = %err, "implicit TLS delivery failed; retrying with STARTTLS");
                transport
                    .deliver(SmtpMode::StartTls, &credentials, message)
                    .await
            }
            other => other,
        };

        let result = match attempt {
            Ok(()) => {
                info!(%recipient, %subject, "sent email notification");
                DeliveryResult::Sent
            }
            Err(err) => {
                error!(error = %err, "email delivery failed");
                DeliveryResult::Failed(err)
            }
        };
        Delivery {
            recipient,
            is_test,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwmon_core::PaymentInfo;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct ScriptedTransport {
        results: Mutex<Vec<Result<(), TransportError>>>,
        calls: Mutex<Vec<(SmtpMode, String)>>,
    }

    impl ScriptedTransport {
        fn with(results: Vec<Result<(), TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                calls: Mutex::default(),
            })
        }

        fn modes(&self) -> Vec<SmtpMode> {
            self.calls.lock().unwrap().iter().map(|(m, _)| *m).collect()
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn deliver(
            &self,
            mode: SmtpMode,
            credentials: &SmtpCredentials,
            _message: Message,
        ) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((mode, credentials.username.clone()));
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }
    }

    fn listing(id: u64, title: &str) -> Listing {
        Listing {
            id,
            title: title.to_string(),
            url: Listing::url_for_id(id),
            description: String::new(),
            category_id: None,
            expired_on: String::new(),
            last_released_at: String::new(),
            payment_info: PaymentInfo::Text("10000円 〜 20000円".into()),
            client_name: String::new(),
            is_employer_certification: false,
        }
    }

    async fn notifier(
        dir: &tempfile::TempDir,
        simulation_mode: bool,
        auto_fallback: bool,
        transport: Arc<ScriptedTransport>,
    ) -> Notifier {
        let path = dir.path().join("email_config.json");
        let mut notifier = Notifier::load(&path, transport).await.unwrap();
        notifier
            .save_credentials("me@gmail.com", "abcdefghijklmnop")
            .await
            .unwrap();
        notifier.set_simulation_mode(simulation_mode).await.unwrap();
        notifier.set_auto_fallback(auto_fallback).await.unwrap();
        notifier
    }

    #[test]
    fn body_lists_ten_and_summarizes_the_rest() {
        let listings: Vec<Listing> = (1..=13).map(|i| listing(i, &format!("案件{i}"))).collect();
        let mail = compose_new_listings("subject", &listings).unwrap();
        assert!(mail.text.starts_with("クラウドワークスに13件の新着案件があります。"));
        assert!(mail.text.contains("1. 案件1 - 10000円 〜 20000円"));
        assert!(mail.text.contains("10. 案件10 - "));
        assert!(!mail.text.contains("11. 案件11"));
        assert!(mail.text.contains("... 他 3 件"));
        assert!(mail.html.contains("<td colspan=\"3\">... 他 3 件</td>"));
        assert!(mail.html.contains("<a href=\"https:"));
        assert!(mail.html.contains(">案件1</a>"));
    }

    #[test]
    fn short_lists_have_no_remainder_line() {
        let mail = compose_new_listings("s", &[listing(1, "")]).unwrap();
        assert!(mail.text.contains("1. タイトルなし - "));
        assert!(!mail.text.contains("他"));
    }

    #[test]
    fn html_body_escapes_titles() {
        let mail = compose_new_listings("s", &[listing(1, "<b>A & B</b>")]).unwrap();
        assert!(mail.html.contains("&lt;b&gt;A &amp; B&lt;"));
        assert!(!mail.html.contains("<b>A"));
        assert!(mail.text.contains("1. <b>A & B</b> - "));
    }

    #[test]
    fn composed_mail_builds_a_multipart_message() {
        let mail = compose_test().unwrap();
        let message = mail.to_message("me@gmail.com", "me@gmail.com").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn auth_errors_carry_advice() {
        let err = TransportError::Auth("535 5.7.8 Username and Password not accepted".into());
        assert!(err.advice().unwrap().contains("ユーザー名またはパスワード"));
        let err = TransportError::Auth("534 Application-specific password required".into());
        assert!(err.advice().unwrap().contains("アプリパスワード"));
        assert!(TransportError::Delivery("timeout".into()).advice().is_none());
    }

    #[tokio::test]
    async fn simulation_mode_logs_and_stamps_last_sent() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::with(vec![]);
        let mut notifier = notifier(&dir, true, true, transport.clone()).await;

        let outcome = notifier.notify_new_listings(&[listing(1, "a")]).await.unwrap();
        assert_eq!(
            outcome,
            NotifyOutcome::Simulated {
                recipient: "me@gmail.com".into()
            }
        );
        assert!(transport.modes().is_empty());
        assert!(notifier.config().last_sent.is_some());

        let reloaded = EmailConfig::load_or_init(&dir.path().join("email_config.json"))
            .await
            .unwrap();
        assert!(reloaded.last_sent.is_some());
    }

    #[tokio::test]
    async fn test_send_does_not_stamp_last_sent() {
        let dir = tempdir().unwrap();
        let mut notifier = notifier(&dir, true, true, ScriptedTransport::with(vec![])).await;
        notifier.send_test().await.unwrap();
        assert!(notifier.config().last_sent.is_none());
    }

    #[tokio::test]
    async fn real_send_uses_implicit_tls() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::with(vec![Ok(())]);
        let mut notifier = notifier(&dir, false, true, transport.clone()).await;

        let outcome = notifier.notify_new_listings(&[listing(1, "a")]).await.unwrap();
        assert!(matches!(outcome, NotifyOutcome::Sent { .. }));
        assert_eq!(transport.modes(), vec![SmtpMode::ImplicitTls]);
    }

    #[tokio::test]
    async fn connection_failure_retries_once_with_starttls() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::with(vec![
            Err(TransportError::Delivery("connection refused".into())),
            Ok(()),
        ]);
        let mut notifier = notifier(&dir, false, true, transport.clone()).await;

        let outcome = notifier.notify_new_listings(&[listing(1, "a")]).await.unwrap();
        assert!(matches!(outcome, NotifyOutcome::Sent { .. }));
        assert_eq!(transport.modes(), vec![SmtpMode::ImplicitTls, SmtpMode::StartTls]);
    }

    #[tokio::test]
    async fn auth_failure_falls_back_to_simulation() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::with(vec![Err(TransportError::Auth(
            "535 Username and Password not accepted".into(),
        ))]);
        let mut notifier = notifier(&dir, false, true, transport.clone()).await;

        let outcome = notifier.notify_new_listings(&[listing(1, "a")]).await.unwrap();
        match outcome {
            NotifyOutcome::SimulatedAfterFallback { advice, .. } => assert!(advice.is_some()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(transport.modes(), vec![SmtpMode::ImplicitTls]);
        assert!(notifier.config().simulation_mode);

        let reloaded = EmailConfig::load_or_init(&dir.path().join("email_config.json"))
            .await
            .unwrap();
        assert!(reloaded.simulation_mode);
    }

    #[tokio::test]
    async fn failure_without_fallback_is_reported() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::with(vec![
            Err(TransportError::Delivery("timeout".into())),
            Err(TransportError::Delivery("timeout".into())),
        ]);
        let mut notifier = notifier(&dir, false, false, transport).await;

        let outcome = notifier.notify_new_listings(&[listing(1, "a")]).await.unwrap();
        assert!(!outcome.is_success());
        assert!(!notifier.config().simulation_mode);
        assert!(notifier.config().last_sent.is_none());
    }

    #[tokio::test]
    async fn prepared_send_delivers_without_the_notifier() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::with(vec![Ok(())]);
        let mut notifier = notifier(&dir, false, true, transport.clone()).await;

        let pending = notifier.prepare_new_listings(&[listing(1, "a")]).unwrap();
        let delivery = tokio::spawn(pending.deliver()).await.unwrap();
        assert_eq!(delivery.result, DeliveryResult::Sent);
        assert!(!delivery.is_test);
        assert!(notifier.config().last_sent.is_none());

        let outcome = notifier.record(delivery).await;
        assert!(matches!(outcome, NotifyOutcome::Sent { .. }));
        assert!(notifier.config().last_sent.is_some());
        assert_eq!(transport.modes(), vec![SmtpMode::ImplicitTls]);
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected_before_sending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("email_config.json");
        let mut notifier = Notifier::load(&path, ScriptedTransport::with(vec![])).await.unwrap();
        let err = notifier
            .save_credentials("me@example.com", "abcdefghijklmnop")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidConfig(ConfigError::NotGmail)));
        assert!(!notifier.is_configured());
        assert!(matches!(
            notifier.send_test().await,
            Err(NotifyError::InvalidConfig(ConfigError::MissingAddress))
        ));
    }
}
