//! Notification channels.
//!
//! A provider turns one mention into side effects: the inbox provider
//! returns notification documents to commit, the email provider posts to
//! an external mail service and returns nothing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use strand_core::markup::to_plain_text;
use strand_core::records::is_active_employee;
use strand_core::{
    class, parse_markup, Doc, DocId, DocNotifyContext, PersonAccount, Reference, TriggerStore, Tx,
    TxFactory,
};

use crate::error::ProviderError;
use crate::ids::{notification_type, provider, NotificationTypeId, ProviderId};
use crate::templates::{TemplateParams, TemplateRegistry};

/// Everything a provider needs to deliver one mention.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    /// Types enabled for this provider.
    pub types: Vec<NotificationTypeId>,
    pub reference: Reference,
    pub context: DocNotifyContext,
    pub receiver: PersonAccount,
    /// Account that wrote the mention.
    pub sender: DocId,
    /// The document the mention is about.
    pub source: Doc,
}

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Deliver `request`. Returned transactions join the derived batch.
    async fn notify(&self, factory: &TxFactory, request: &NotificationRequest) -> Result<Vec<Tx>, ProviderError>;
}

/// Writes a notification into the receiver's inbox. A request carrying
/// the mention type becomes a mention notification; one that a message
/// notification took over becomes a plain inbox notification.
#[derive(Debug, Default)]
pub struct InboxProvider;

#[async_trait]
impl NotificationProvider for InboxProvider {
    fn id(&self) -> ProviderId {
        provider::INBOX
    }

    async fn notify(&self, factory: &TxFactory, request: &NotificationRequest) -> Result<Vec<Tx>, ProviderError> {
        let reference = &request.reference;
        let mut attrs = strand_core::Attributes::new();
        attrs.insert("user".into(), json!(request.receiver.id));
        attrs.insert("docNotifyContext".into(), json!(request.context.id));
        attrs.insert("isViewed".into(), json!(false));
        attrs.insert("mentionedIn".into(), json!(reference.mention_anchor()));
        attrs.insert("mentionedInClass".into(), json!(reference.mention_anchor_class()));
        attrs.insert("messageHtml".into(), json!(reference.message));
        attrs.insert("sender".into(), json!(request.sender));
        attrs.insert("types".into(), json!(request.types));

        let inbox_class = if request.types.contains(&notification_type::MENTION) {
            class::MENTION_INBOX_NOTIFICATION
        } else {
            class::INBOX_NOTIFICATION
        };
        Ok(vec![factory.create_doc(
            inbox_class,
            request.context.space,
            DocId::new(),
            attrs,
        )])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EmailConfig {
    /// Base URL of the mail service. Email is disabled without one.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Base URL used to build links back to documents.
    #[serde(default)]
    pub front_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            front_url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MailMessage<'a> {
    text: &'a str,
    html: &'a str,
    subject: &'a str,
    to: Vec<&'a str>,
}

/// Sends mention emails through an HTTP mail service (`POST {endpoint}/send`).
pub struct EmailProvider {
    config: EmailConfig,
    store: Arc<dyn TriggerStore>,
    templates: TemplateRegistry,
    http: reqwest::Client,
}

impl EmailProvider {
    pub fn new(config: EmailConfig, store: Arc<dyn TriggerStore>, templates: TemplateRegistry) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            config,
            store,
            templates,
            http,
        }
    }

    async fn sender_name(&self, sender: DocId) -> Result<String, ProviderError> {
        let Some(account) = self.store.get(sender).await?.as_ref().and_then(PersonAccount::from_doc) else {
            return Ok("System".into());
        };
        let person = self.store.get(account.person).await?;
        Ok(person
            .as_ref()
            .and_then(|p| p.str_attr("name"))
            .map(str::to_string)
            .unwrap_or(account.email))
    }

    fn params(&self, request: &NotificationRequest, sender: String) -> TemplateParams {
        let source = &request.source;
        let title = ["title", "name"]
            .iter()
            .find_map(|attr| source.str_attr(attr))
            .map(str::to_string)
            .unwrap_or_else(|| source.class.to_string());
        let message = parse_markup(&request.reference.message)
            .map(|node| to_plain_text(&node))
            .unwrap_or_default();
        let link = match &self.config.front_url {
            Some(base) => format!("{}/browse/{}", base.trim_end_matches('/'), source.id),
            None => String::new(),
        };

        let mut params = TemplateParams::new();
        params.insert("sender", sender);
        params.insert("title", title);
        params.insert("message", message);
        params.insert("link", link);
        params
    }
}

#[async_trait]
impl NotificationProvider for EmailProvider {
    fn id(&self) -> ProviderId {
        provider::EMAIL
    }

    async fn notify(&self, _factory: &TxFactory, request: &NotificationRequest) -> Result<Vec<Tx>, ProviderError> {
        let Some(endpoint) = &self.config.endpoint else {
            log::debug!("Email endpoint not configured, skipping mention email");
            return Ok(Vec::new());
        };
        if request.receiver.email.is_empty() {
            return Ok(Vec::new());
        }
        let person = self.store.get(request.receiver.person).await?;
        if !person.as_ref().is_some_and(is_active_employee) {
            log::debug!("Receiver {} is not an active employee, no email", request.receiver.id);
            return Ok(Vec::new());
        }

        let sender = self.sender_name(request.sender).await?;
        let params = self.params(request, sender);
        let message = self
            .templates
            .render(&request.types, &params)
            .ok_or_else(|| {
                ProviderError::MissingTemplate(
                    request.types.first().map(ToString::to_string).unwrap_or_default(),
                )
            })?;

        let body = MailMessage {
            text: &message.text,
            html: &message.html,
            subject: &message.subject,
            to: vec![&request.receiver.email],
        };
        let url = format!("{}/send", endpoint.trim_end_matches('/'));
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Rejected {
                status: response.status().as_u16(),
            });
        }
        log::info!("Sent mention email to {}", request.receiver.email);
        Ok(Vec::new())
    }
}
