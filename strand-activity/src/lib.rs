//! # strand-activity: References, mentions and notifications
//!
//! Server-side triggers that run after a transaction commits:
//!
//! - [`references`]: extracts mentions from content and reconciles the
//!   stored references and mention markers
//! - [`notify`]: turns person mentions into inbox entries, emails,
//!   collaborator subscriptions and space membership
//! - [`rules`]: which providers deliver which notification types
//! - [`providers`]: inbox and email channels
//! - [`templates`]: subject/body templates for out-of-band channels
//! - [`pipeline`]: partitioned async execution over the transaction log

pub mod error;
pub mod ids;
pub mod notify;
pub mod pipeline;
pub mod providers;
pub mod references;
pub mod rules;
pub mod templates;

pub use error::{ActivityError, ActivityResult, ProviderError};
pub use ids::{notification_type, provider, NotificationTypeId, ProviderId};
pub use notify::MentionDispatcher;
pub use pipeline::{PipelineConfig, PipelineStats, TriggerPipeline};
pub use providers::{EmailConfig, EmailProvider, InboxProvider, NotificationProvider, NotificationRequest};
pub use references::{reconcile, ReferenceDiff, ReferenceTrigger};
pub use rules::{NotificationRules, NotificationSettings, NotifyResult, PreferenceRules};
pub use templates::{RenderedMessage, Template, TemplateRegistry};
