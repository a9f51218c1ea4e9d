//! Message templates for out-of-band notification channels.
//!
//! Templates use `{name}` placeholders. Values substituted into the HTML
//! body are escaped; unknown placeholders are left as written.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::ids::{notification_type, NotificationTypeId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub type TemplateParams = BTreeMap<&'static str, String>;

#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<NotificationTypeId, Template>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            notification_type::MENTION,
            Template {
                subject: "{sender} mentioned you in {title}".into(),
                text: "{sender} mentioned you in {title}:\n\n{message}\n\n{link}".into(),
                html: "<p><b>{sender}</b> mentioned you in <a href=\"{link}\">{title}</a></p><p>{message}</p>"
                    .into(),
            },
        );
        registry.register(
            notification_type::COLLABORATOR_MESSAGE,
            Template {
                subject: "{sender} wrote in {title}".into(),
                text: "{sender} wrote in {title}:\n\n{message}\n\n{link}".into(),
                html: "<p><b>{sender}</b> wrote in <a href=\"{link}\">{title}</a></p><p>{message}</p>".into(),
            },
        );
        registry
    }
}

impl TemplateRegistry {
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: NotificationTypeId, template: Template) {
        self.templates.insert(kind, template);
    }

    /// Render the template of the first type in `kinds` that has one.
    pub fn render(&self, kinds: &[NotificationTypeId], params: &TemplateParams) -> Option<RenderedMessage> {
        let template = kinds.iter().find_map(|k| self.templates.get(k))?;
        Some(RenderedMessage {
            subject: fill(&template.subject, params, false),
            text: fill(&template.text, params, false),
            html: fill(&template.html, params, true),
        })
    }
}

fn fill(template: &str, params: &TemplateParams, escape: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find('}').map(|end| (&tail[1..end], end)) {
            Some((name, end)) if params.contains_key(name) => {
                let value = &params[name];
                if escape {
                    out.push_str(&escape_html(value));
                } else {
                    out.push_str(value);
                }
                rest = &tail[end + 1..];
            }
            _ => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
