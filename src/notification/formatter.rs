//! 消息格式化模块 - 将事件渲染为邮件主题、HTML 正文和纯文本正文
//!
//! 主要功能：
//! - 主题模板替换（`{camera}` `{label}` `{score}` `{zones}`）
//! - HTML 正文，内联图片通过 `cid:` 引用
//! - 纯文本正文，供不支持 HTML 的客户端使用
//! - 可选的回看页面与视频片段链接

use chrono::{Local, TimeZone};

use super::channel::{InlineImage, MessageMetadata, OutgoingMessage};
use crate::event::NormalizedEvent;
use crate::rules::NotificationRule;

const STYLE: &str = r#"
        body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px; }
        .header { background: #2563eb; color: white; padding: 20px; border-radius: 8px 8px 0 0; }
        .header h1 { margin: 0; font-size: 24px; }
        .content { background: #f8fafc; padding: 20px; border: 1px solid #e2e8f0; border-radius: 0 0 8px 8px; }
        .image-container { text-align: center; margin: 20px 0; }
        .image-container img { max-width: 100%; border-radius: 8px; }
        .details { background: white; padding: 15px; border-radius: 8px; margin: 15px 0; }
        .detail-row { display: flex; padding: 8px 0; border-bottom: 1px solid #e2e8f0; }
        .detail-label { font-weight: 600; width: 140px; color: #64748b; }
        .detail-value { flex: 1; }
        .button { display: inline-block; background: #2563eb; color: white; padding: 12px 24px; text-decoration: none; border-radius: 6px; margin: 10px 4px; }
"#;

/// 消息格式化器
#[derive(Debug, Clone, Default)]
pub struct MessageFormatter {
    /// 用户可访问的 NVR 地址，用于生成回看和片段链接
    external_url: Option<String>,
}

impl MessageFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置外部访问地址（末尾的 `/` 会被去掉）
    pub fn with_external_url(mut self, url: Option<String>) -> Self {
        self.external_url = url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
        self
    }

    pub fn review_url(&self, event_id: &str) -> Option<String> {
        self.external_url
            .as_ref()
            .map(|base| format!("{}/review#{}", base, event_id))
    }

    pub fn clip_url(&self, event_id: &str) -> Option<String> {
        self.external_url
            .as_ref()
            .map(|base| format!("{}/api/events/{}/clip.mp4", base, event_id))
    }

    /// 渲染完整消息
    pub fn render(
        &self,
        rule: &NotificationRule,
        event: &NormalizedEvent,
        images: Vec<InlineImage>,
    ) -> OutgoingMessage {
        let subject = render_subject(&rule.subject_template, event);
        let html = self.render_html(event, &images, rule.include_urls);
        let plain = self.render_plain(event, rule.include_urls);

        let mut message = OutgoingMessage::new(rule.targets.clone(), subject)
            .with_bodies(html, plain)
            .with_metadata(MessageMetadata {
                rule: rule.name.clone(),
                subject_id: event.subject_id.clone(),
                kind: event.kind.clone(),
                event_id: event.event_id.clone(),
            });
        message.inline_images = images;
        message
    }

    /// HTML 正文
    pub fn render_html(
        &self,
        event: &NormalizedEvent,
        images: &[InlineImage],
        include_urls: bool,
    ) -> String {
        let mut html = String::with_capacity(4096);
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n    <meta charset=\"utf-8\">\n    <style>");
        html.push_str(STYLE);
        html.push_str("    </style>\n</head>\n<body>\n");
        html.push_str(&format!(
            "    <div class=\"header\">\n        <h1>{} Detected</h1>\n    </div>\n    <div class=\"content\">\n",
            escape_html(&title_case(&event.kind))
        ));

        for image in images {
            html.push_str(&format!(
                "        <div class=\"image-container\">\n            <img src=\"cid:{}\" alt=\"Detection {}\">\n        </div>\n",
                escape_html(&image.content_id),
                image.kind
            ));
        }

        html.push_str("        <div class=\"details\">\n");
        for (label, value) in detail_rows(event, true) {
            html.push_str(&format!(
                "            <div class=\"detail-row\"><span class=\"detail-label\">{}</span><span class=\"detail-value\">{}</span></div>\n",
                escape_html(&label),
                escape_html(&value)
            ));
        }
        html.push_str("        </div>\n");

        if include_urls {
            if let (Some(review), Some(clip)) =
                (self.review_url(&event.event_id), self.clip_url(&event.event_id))
            {
                html.push_str(&format!(
                    "        <div style=\"text-align: center;\">\n            <a href=\"{}\" class=\"button\">View Review Page</a>\n            <a href=\"{}\" class=\"button\">View Video Clip</a>\n        </div>\n",
                    escape_html(&review),
                    escape_html(&clip)
                ));
            }
        }

        html.push_str("    </div>\n</body>\n</html>\n");
        html
    }

    /// 纯文本正文
    pub fn render_plain(&self, event: &NormalizedEvent, include_urls: bool) -> String {
        let mut lines = vec!["Details:".to_string()];
        for (label, value) in detail_rows(event, false) {
            lines.push(format!("- {}: {}", label, value));
        }

        if include_urls {
            if let (Some(review), Some(clip)) =
                (self.review_url(&event.event_id), self.clip_url(&event.event_id))
            {
                lines.push(String::new());
                lines.push(format!("Review Page: {}", review));
                lines.push(format!("Video Clip: {}", clip));
            }
        }
        lines.join("\n")
    }
}

/// 详情行，`full` 为 false 时只保留纯文本需要的几行
fn detail_rows(event: &NormalizedEvent, full: bool) -> Vec<(String, String)> {
    let mut rows = vec![
        ("Camera".to_string(), event.subject_id.clone()),
        ("Object".to_string(), event.kind.clone()),
        ("Confidence".to_string(), percent(event.top_score)),
        ("Time".to_string(), format_timestamp(event.timestamp)),
    ];

    if !full {
        rows.push(("Zones".to_string(), join_or(&event.zones_current, "None")));
        return rows;
    }

    rows.push((
        "Current Zones".to_string(),
        join_or(&event.zones_current, "None"),
    ));
    rows.push((
        "Entered Zones".to_string(),
        join_or(&event.zones_entered, "None"),
    ));

    if let Some((name, score)) = &event.sub_label {
        let value = if *score > 0.0 {
            format!("{} ({})", name, percent(*score))
        } else {
            name.clone()
        };
        rows.push(("Identified As".to_string(), value));
    }

    if !event.attributes.is_empty() {
        let attrs: Vec<String> = event
            .attributes
            .iter()
            .map(|(k, v)| format!("{}: {}", k, percent(*v)))
            .collect();
        rows.push(("Attributes".to_string(), attrs.join(", ")));
    }

    for (key, value) in &event.details {
        rows.push((title_case(key), value.clone()));
    }
    rows
}

/// 主题模板替换
///
/// 支持 `{camera}` `{label}` `{score}` `{zones}`，以及别名 `{subject}` `{kind}` `{phase}`。
/// 未知占位符保持原样。
pub fn render_subject(template: &str, event: &NormalizedEvent) -> String {
    let zones = join_or(&event.zones_current, "none");
    let score = percent(event.top_score);
    template
        .replace("{camera}", &event.subject_id)
        .replace("{subject}", &event.subject_id)
        .replace("{label}", &event.kind)
        .replace("{kind}", &event.kind)
        .replace("{score}", &score)
        .replace("{zones}", &zones)
        .replace("{phase}", event.phase.as_str())
}

/// 0.82 -> "82%"
pub fn percent(value: f64) -> String {
    format!("{:.0}%", value * 100.0)
}

/// 本地时间，如 `2024-01-05 07:30:00 PM`
pub fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.floor() as i64;
    let nanos = ((timestamp - timestamp.floor()) * 1e9) as u32;
    match Local.timestamp_opt(secs, nanos).single() {
        Some(dt) => dt.format("%Y-%m-%d %I:%M:%S %p").to_string(),
        None => format!("{:.0}", timestamp),
    }
}

/// "doorbell_press" -> "Doorbell Press"
pub fn title_case(s: &str) -> String {
    s.split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn join_or<'a, I>(items: I, empty: &str) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let joined: Vec<&str> = items.into_iter().map(String::as_str).collect();
    if joined.is_empty() {
        empty.to_string()
    } else {
        joined.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPhase;
    use crate::notification::channel::ImageKind;
    use crate::rules::{NotificationRule, RuleDefinition};

    fn event() -> NormalizedEvent {
        NormalizedEvent::new("front_door", "person", 1_700_000_000.0)
            .with_phase(EventPhase::New)
            .with_score(0.6)
            .with_top_score(0.82)
            .with_zones(["porch", "driveway"])
            .with_event_id("evt-1")
    }

    fn rule(include_urls: bool) -> NotificationRule {
        NotificationRule::compile(
            &RuleDefinition {
                targets: Some(vec!["a@example.com".into(), "b@example.com".into()]),
                include_urls: Some(include_urls),
                ..Default::default()
            },
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_render_subject_default_template() {
        assert_eq!(
            render_subject("[{camera}] {label} detected", &event()),
            "[front_door] person detected"
        );
    }

    #[test]
    fn test_render_subject_placeholders() {
        let s = render_subject("{label} {score} in {zones} ({phase}) {unknown}", &event());
        assert_eq!(s, "person 82% in driveway, porch (new) {unknown}");

        let no_zones = NormalizedEvent::new("cam", "car", 0.0);
        assert_eq!(render_subject("{zones}", &no_zones), "none");
    }

    #[test]
    fn test_urls_require_external_url() {
        let formatter = MessageFormatter::new();
        assert_eq!(formatter.review_url("x"), None);

        let formatter =
            MessageFormatter::new().with_external_url(Some("https://nvr.example.com/".into()));
        assert_eq!(
            formatter.review_url("evt-1").as_deref(),
            Some("https://nvr.example.com/review#evt-1")
        );
        assert_eq!(
            formatter.clip_url("evt-1").as_deref(),
            Some("https://nvr.example.com/api/events/evt-1/clip.mp4")
        );
    }

    #[test]
    fn test_render_html_with_images_and_links() {
        let formatter =
            MessageFormatter::new().with_external_url(Some("https://nvr.example.com".into()));
        let images = vec![InlineImage {
            kind: ImageKind::Thumbnail,
            content_id: ImageKind::Thumbnail.content_id("evt-1"),
            data: vec![1, 2, 3],
        }];
        let html = formatter.render_html(&event(), &images, true);

        assert!(html.contains("<h1>Person Detected</h1>"));
        assert!(html.contains("cid:thumbnail_evt-1"));
        assert!(html.contains("82%"));
        assert!(html.contains("driveway, porch"));
        assert!(html.contains("https://nvr.example.com/review#evt-1"));

        let without = formatter.render_html(&event(), &[], false);
        assert!(!without.contains("review#"));
        assert!(!without.contains("cid:"));
    }

    #[test]
    fn test_render_html_escapes() {
        let e = NormalizedEvent::new("<script>", "a&b", 0.0)
            .with_sub_label("O'Brien", 0.9);
        let html = MessageFormatter::new().render_html(&e, &[], false);
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("A&amp;b Detected"));
        assert!(html.contains("O&#39;Brien (90%)"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_render_plain() {
        let formatter =
            MessageFormatter::new().with_external_url(Some("http://nvr:5000".into()));
        let text = formatter.render_plain(&event(), true);
        assert!(text.starts_with("Details:\n- Camera: front_door\n- Object: person"));
        assert!(text.contains("- Confidence: 82%"));
        assert!(text.contains("- Zones: driveway, porch"));
        assert!(text.contains("Video Clip: http://nvr:5000/api/events/evt-1/clip.mp4"));
    }

    #[test]
    fn test_render_message() {
        let formatter = MessageFormatter::new();
        let msg = formatter.render(&rule(true), &event(), Vec::new());
        assert_eq!(msg.targets, vec!["a@example.com", "b@example.com"]);
        assert_eq!(msg.subject, "[front_door] person detected");
        assert_eq!(msg.metadata.rule, "rule-0");
        assert_eq!(msg.metadata.event_id, "evt-1");
        assert!(msg.inline_images.is_empty());
    }

    #[test]
    fn test_details_rendered() {
        let e = NormalizedEvent::new("aa:bb:cc:dd:ee:ff", "new_device", 0.0)
            .with_detail("ip_address", "192.168.1.40");
        let text = MessageFormatter::new().render_html(&e, &[], false);
        assert!(text.contains("Ip Address"));
        assert!(text.contains("192.168.1.40"));
    }

    #[test]
    fn test_helpers() {
        assert_eq!(title_case("doorbell_press"), "Doorbell Press");
        assert_eq!(title_case("PERSON"), "Person");
        assert_eq!(percent(0.821), "82%");
        assert_eq!(percent(1.0), "100%");
        let ts = format_timestamp(1_700_000_000.0);
        assert!(ts.ends_with("AM") || ts.ends_with("PM"));
        assert_eq!(ts.len(), "2023-11-14 10:13:20 PM".len());
    }
}
