//! sendmail 渠道 - 构造 MIME 邮件并通过 `sendmail -t` 投递
//!
//! 邮件结构：multipart/related { multipart/alternative { text, html }, 内联图片... }

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

use crate::exec::run_with_timeout;
use crate::notification::channel::{Mailer, OutgoingMessage};

const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";

/// sendmail 渠道配置
#[derive(Debug, Clone)]
pub struct SendmailConfig {
    /// sendmail 路径
    pub sendmail_path: String,
    pub from_address: String,
    pub from_name: String,
    pub timeout: Duration,
}

impl Default for SendmailConfig {
    fn default() -> Self {
        Self {
            sendmail_path: DEFAULT_SENDMAIL.to_string(),
            from_address: String::new(),
            from_name: "Event Notifier".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// sendmail 渠道
pub struct SendmailMailer {
    config: SendmailConfig,
    binary: PathBuf,
}

impl SendmailMailer {
    pub fn new(config: SendmailConfig) -> Self {
        let binary = resolve_binary(&config.sendmail_path);
        Self { config, binary }
    }

    /// 构造完整的 MIME 消息
    pub fn build_mime(&self, message: &OutgoingMessage) -> String {
        let boundary_seed = format!(
            "{}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            message.metadata.event_id.len()
        );
        let related = format!("related-{}", boundary_seed);
        let alternative = format!("alt-{}", boundary_seed);

        let mut out = String::with_capacity(4096);
        if !self.config.from_address.is_empty() {
            out.push_str(&format!(
                "From: {} <{}>\r\n",
                encode_header(&self.config.from_name),
                sanitize_header(&self.config.from_address)
            ));
        }
        let targets: Vec<String> = message.targets.iter().map(|t| sanitize_header(t)).collect();
        out.push_str(&format!("To: {}\r\n", targets.join(", ")));
        out.push_str(&format!("Subject: {}\r\n", encode_header(&message.subject)));
        out.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str(&format!(
            "Content-Type: multipart/related; boundary=\"{}\"\r\n\r\n",
            related
        ));

        out.push_str(&format!("--{}\r\n", related));
        out.push_str(&format!(
            "Content-Type: multipart/alternative; boundary=\"{}\"\r\n\r\n",
            alternative
        ));
        for (mime, body) in [
            ("text/plain", &message.plain_body),
            ("text/html", &message.html_body),
        ] {
            out.push_str(&format!("--{}\r\n", alternative));
            out.push_str(&format!("Content-Type: {}; charset=\"utf-8\"\r\n", mime));
            out.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
            out.push_str(&wrap_base64(body.as_bytes()));
        }
        out.push_str(&format!("--{}--\r\n", alternative));

        for image in &message.inline_images {
            out.push_str(&format!("--{}\r\n", related));
            out.push_str("Content-Type: image/jpeg\r\n");
            out.push_str("Content-Transfer-Encoding: base64\r\n");
            let content_id = sanitize_header(&image.content_id);
            out.push_str(&format!("Content-ID: <{}>\r\n", content_id));
            out.push_str(&format!(
                "Content-Disposition: inline; filename=\"{}.jpg\"\r\n\r\n",
                content_id
            ));
            out.push_str(&wrap_base64(&image.data));
        }
        out.push_str(&format!("--{}--\r\n", related));
        out
    }
}

impl Mailer for SendmailMailer {
    fn name(&self) -> &str {
        "sendmail"
    }

    fn send(&self, message: &OutgoingMessage) -> Result<bool> {
        if message.targets.is_empty() {
            return Err(anyhow!("no recipients"));
        }

        let mime = self.build_mime(message);
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-t", "-i"]);
        if !self.config.from_address.is_empty() {
            cmd.args(["-f", &self.config.from_address]);
        }

        let output = run_with_timeout(&mut cmd, Some(mime.as_bytes()), self.config.timeout)
            .with_context(|| format!("failed to run {}", self.binary.display()))?;

        if output.timed_out() {
            return Err(anyhow!(
                "sendmail did not finish within {:?}",
                self.config.timeout
            ));
        }

        if output.success() {
            info!(
                channel = "sendmail",
                recipients = message.targets.len(),
                title = %message.subject,
                "Email handed to sendmail"
            );
            Ok(true)
        } else {
            warn!(
                channel = "sendmail",
                status = ?output.status,
                error = %output.stderr.trim(),
                "sendmail rejected message"
            );
            Ok(false)
        }
    }
}

/// 配置路径存在则直接使用，否则从 PATH 查找
fn resolve_binary(configured: &str) -> PathBuf {
    let path = PathBuf::from(configured);
    if path.exists() {
        return path;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sendmail".to_string());
    which::which(&name).unwrap_or(path)
}

/// 头部值中的控制字符（含 CR/LF）替换为空格，`sendmail -t` 会从头部读取收件人
fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// 非 ASCII 头部使用 RFC 2047 编码
fn encode_header(value: &str) -> String {
    let value = sanitize_header(value);
    if value.is_ascii() {
        value
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

/// base64 编码并按 76 字符换行
fn wrap_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 76 * 2 + 2);
    for chunk in encoded.as_bytes().chunks(76) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::channel::{ImageKind, InlineImage};

    fn message() -> OutgoingMessage {
        OutgoingMessage::new(
            vec!["a@example.com".into(), "b@example.com".into()],
            "[front_door] person detected",
        )
        .with_bodies("<p>person</p>", "Details:\n- Object: person")
        .with_image(InlineImage {
            kind: ImageKind::Thumbnail,
            content_id: "thumbnail_evt-1".into(),
            data: vec![0xff, 0xd8, 0xff, 0xe0],
        })
    }

    fn mailer() -> SendmailMailer {
        SendmailMailer::new(SendmailConfig {
            from_address: "nvr@example.com".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_build_mime_structure() {
        let mime = mailer().build_mime(&message());
        assert!(mime.contains("From: Event Notifier <nvr@example.com>\r\n"));
        assert!(mime.contains("To: a@example.com, b@example.com\r\n"));
        assert!(mime.contains("Subject: [front_door] person detected\r\n"));
        assert!(mime.contains("multipart/related"));
        assert!(mime.contains("multipart/alternative"));
        assert!(mime.contains("Content-ID: <thumbnail_evt-1>"));
        assert!(mime.contains(&STANDARD.encode("<p>person</p>")));
        assert!(mime.trim_end().ends_with("--"));
    }

    #[test]
    fn test_encode_header() {
        assert_eq!(encode_header("plain"), "plain");
        let encoded = encode_header("前门有人");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.ends_with("?="));
    }

    #[test]
    fn test_header_values_cannot_add_headers() {
        use crate::event::{EventPhase, NormalizedEvent};
        use crate::notification::formatter::MessageFormatter;
        use crate::rules::{NotificationRule, RuleDefinition};

        let rule = NotificationRule::compile(
            &RuleDefinition {
                targets: Some(vec!["home@example.com\r\nCc: x@example.net".into()]),
                include_urls: Some(false),
                ..Default::default()
            },
            0,
        )
        .unwrap();
        let event = NormalizedEvent::new("porch\r\nBcc: evil@attacker.example", "person", 0.0)
            .with_phase(EventPhase::New)
            .with_score(0.9);
        let message = MessageFormatter::new().render(&rule, &event, Vec::new());

        let mime = mailer().build_mime(&message);
        let headers: Vec<&str> = mime.split("\r\n\r\n").next().unwrap().split("\r\n").collect();
        assert!(headers.iter().all(|h| !h.starts_with("Bcc:") && !h.starts_with("Cc:")));
        assert!(headers.contains(&"Subject: [porch  Bcc: evil@attacker.example] person detected"));
        assert!(headers.contains(&"To: home@example.com  Cc: x@example.net"));
    }

    #[test]
    fn test_wrap_base64_line_length() {
        let wrapped = wrap_base64(&[7u8; 200]);
        assert!(wrapped.lines().all(|l| l.trim_end().len() <= 76));
        assert!(wrapped.lines().count() > 1);
    }

    #[test]
    fn test_send_requires_recipients() {
        let msg = OutgoingMessage::new(Vec::new(), "nobody");
        assert!(mailer().send(&msg).is_err());
    }

    #[cfg(unix)]
    fn fake_sendmail(dir: &std::path::Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn test_send_through_fake_sendmail() {
        let dir = tempfile::TempDir::new().unwrap();
        let captured = dir.path().join("captured.eml");
        let ok = fake_sendmail(
            dir.path(),
            "sendmail-ok",
            &format!("cat > '{}'", captured.display()),
        );
        let m = SendmailMailer::new(SendmailConfig {
            sendmail_path: ok,
            ..Default::default()
        });
        assert!(m.send(&message()).unwrap());
        let written = std::fs::read_to_string(&captured).unwrap();
        assert!(written.contains("Subject: [front_door] person detected"));

        let failing = fake_sendmail(dir.path(), "sendmail-fail", "cat > /dev/null; exit 75");
        let m = SendmailMailer::new(SendmailConfig {
            sendmail_path: failing,
            ..Default::default()
        });
        assert!(!m.send(&message()).unwrap());
    }
}
