//! Message bodies built from Handlebars templates.
//!
//! Templates see the alert as:
//!
//! | field            | value                                     |
//! |------------------|-------------------------------------------|
//! | `status`         | `firing` or `resolved`                    |
//! | `labels`         | label map                                 |
//! | `annotations`    | annotation map                            |
//! | `generatorQuery` | alerting expression from `generatorURL`   |
//! | `startsAt`       | RFC 3339 start time                       |
//! | `endsAt`         | RFC 3339 end time, or null                |
//! | `fingerprint`    | Alertmanager fingerprint                  |
//! | `channel`        | channel the message is posted to          |
//!
//! Helpers: `{{toUpper value}}` and `{{dateFormat "<strftime>" value}}`, where
//! the value is an RFC 3339 string or unix seconds.

use chrono::{DateTime, SecondsFormat, Utc};
use handlebars::{
    no_escape, Context as HbsContext, Handlebars, Helper, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use serde::Serialize;
use serde_json::Value;
use slack::Block;
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::alert::Alert;
use crate::error::TemplateError;

pub const DEFAULT_HEADER_TEMPLATE: &str = "*[{{toUpper status}}] {{labels.alertname}}*";

pub const DEFAULT_MESSAGE_TEMPLATE: &str = "{{annotations.summary}}\n\
{{#if annotations.description}}{{annotations.description}}\n{{/if}}\
*Started:* {{dateFormat \"%Y-%m-%d %H:%M:%S UTC\" startsAt}}";

pub const DEFAULT_FOOTER_TEMPLATE: &str = "{{#if endsAt}}Resolved at \
{{dateFormat \"%Y-%m-%d %H:%M:%S UTC\" endsAt}}{{else}}Resolved{{/if}}";

const HEADER: &str = "header";
const MESSAGE: &str = "message";
const FOOTER: &str = "footer";

/// An uploaded chart to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartImage {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateContext<'a> {
    status: &'static str,
    labels: &'a HashMap<String, String>,
    annotations: &'a HashMap<String, String>,
    generator_query: String,
    starts_at: String,
    ends_at: Option<String>,
    fingerprint: &'a str,
    channel: &'a str,
}

impl<'a> TemplateContext<'a> {
    fn new(alert: &'a Alert, channel: &'a str) -> Self {
        Self {
            status: alert.status.as_str(),
            labels: &alert.labels,
            annotations: &alert.annotations,
            generator_query: alert.generator_query(),
            starts_at: alert.starts_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ends_at: alert
                .ends_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            fingerprint: &alert.fingerprint,
            channel,
        }
    }
}

/// Upper-case a value.
/// Usage: `{{toUpper status}}`
fn to_upper_helper(
    h: &Helper,
    _: &Handlebars,
    _: &HbsContext,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h
        .param(0)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("toUpper", 0))?
        .value();
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    out.write(&text.to_uppercase())?;
    Ok(())
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                s.trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
            }),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Format a timestamp with a strftime layout.
/// Usage: `{{dateFormat "%H:%M" startsAt}}`
fn date_format_helper(
    h: &Helper,
    _: &Handlebars,
    _: &HbsContext,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let layout = h
        .param(0)
        .and_then(|p| p.value().as_str())
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("dateFormat", 0))?;
    let value = h
        .param(1)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("dateFormat", 1))?
        .value();
    let time = parse_timestamp(value).ok_or_else(|| {
        RenderErrorReason::Other(format!("dateFormat: not a timestamp: {value}"))
    })?;

    let mut formatted = String::new();
    write!(formatted, "{}", time.format(layout))
        .map_err(|_| RenderErrorReason::Other(format!("dateFormat: invalid layout {layout:?}")))?;
    out.write(&formatted)?;
    Ok(())
}

/// Builds message blocks for an alert.
pub struct MessageComposer {
    registry: Handlebars<'static>,
    has_footer: bool,
}

impl std::fmt::Debug for MessageComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageComposer")
            .field("has_footer", &self.has_footer)
            .finish_non_exhaustive()
    }
}

impl MessageComposer {
    /// Compile the templates. An empty footer template disables the footer.
    pub fn new(header: &str, message: &str, footer: &str) -> Result<Self, TemplateError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(no_escape);
        registry.set_strict_mode(false);
        registry.register_helper("toUpper", Box::new(to_upper_helper));
        registry.register_helper("dateFormat", Box::new(date_format_helper));

        let has_footer = !footer.trim().is_empty();
        let mut templates = vec![(HEADER, header), (MESSAGE, message)];
        if has_footer {
            templates.push((FOOTER, footer));
        }
        for (name, source) in templates {
            registry
                .register_template_string(name, source)
                .map_err(|source| TemplateError::Compile {
                    name,
                    source: Box::new(source),
                })?;
        }

        Ok(Self {
            registry,
            has_footer,
        })
    }

    fn render(&self, name: &str, alert: &Alert, channel: &str) -> Result<String, TemplateError> {
        Ok(self
            .registry
            .render(name, &TemplateContext::new(alert, channel))?)
    }

    fn image_blocks(images: &[ChartImage]) -> impl Iterator<Item = Block> + '_ {
        images
            .iter()
            .map(|image| Block::chart_image(&image.url, &image.title))
    }

    /// Header, body and one image per chart.
    pub fn full_message(
        &self,
        alert: &Alert,
        channel: &str,
        images: &[ChartImage],
    ) -> Result<Vec<Block>, TemplateError> {
        let mut blocks = vec![
            Block::section(&self.render(HEADER, alert, channel)?),
            Block::section(&self.render(MESSAGE, alert, channel)?),
        ];
        blocks.extend(Self::image_blocks(images));
        Ok(blocks)
    }

    /// Header and one image per chart.
    pub fn short_message(
        &self,
        alert: &Alert,
        channel: &str,
        images: &[ChartImage],
    ) -> Result<Vec<Block>, TemplateError> {
        let mut blocks = vec![Block::section(&self.render(HEADER, alert, channel)?)];
        blocks.extend(Self::image_blocks(images));
        Ok(blocks)
    }

    /// Footer context block, if a footer template is configured.
    pub fn footer(&self, alert: &Alert, channel: &str) -> Result<Option<Block>, TemplateError> {
        if !self.has_footer {
            return Ok(None);
        }
        Ok(Some(Block::footer(&self.render(FOOTER, alert, channel)?)))
    }
}
