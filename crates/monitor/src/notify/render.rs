use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::json;
use std::net::Ipv6Addr;
use tera::Tera;

use super::MaskPolicy;
use crate::{
    alerting::{Subject, Transition},
    store::{AlertKind, SubjectType},
    template::{compile_templates, render_named},
    Result,
};

const REDACTED: &str = "[redacted]";
// Longest textual IPv6 form, e.g. "ffff:ffff:ffff:ffff:ffff:ffff:255.255.255.255".
const MAX_IPV6_LEN: usize = 45;

lazy_static! {
    // Unanchored: an address glued to a name ("srv10.0.0.5") must still match.
    static ref IPV4: Regex =
        Regex::new(r"\d{1,3}(?:\.\d{1,3}){3}").expect("IPv4 pattern compiles");
    // Any run of hex digits, dots, and at least two colons; narrowed by parsing.
    static ref IPV6_CANDIDATE: Regex =
        Regex::new(r"[0-9A-Fa-f.]*:[0-9A-Fa-f:.]*:[0-9A-Fa-f:.]*").expect("IPv6 pattern compiles");
}

/// Replaces IPv4 and IPv6 literals with a placeholder, including literals
/// embedded in longer words.
pub fn scrub_ips(text: &str) -> String {
    let without_v6 =
        IPV6_CANDIDATE.replace_all(text, |caps: &Captures| redact_ipv6(&caps[0]));
    IPV4.replace_all(&without_v6, REDACTED).into_owned()
}

fn is_ipv6(s: &str) -> bool {
    s.matches(':').count() >= 2
        && s.bytes().any(|b| b.is_ascii_hexdigit())
        && s.parse::<Ipv6Addr>().is_ok()
}

/// Redacts every address inside a candidate run, taking the longest parse
/// from the leftmost start. Leading or trailing hex letters stay.
fn redact_ipv6(candidate: &str) -> String {
    // Candidates are ASCII, so byte offsets are char boundaries.
    let len = candidate.len();
    let mut out = String::with_capacity(len);
    let mut copied = 0;
    let mut start = 0;

    while start < len {
        let longest = (start + 2..=len.min(start + MAX_IPV6_LEN))
            .rev()
            .find(|&end| is_ipv6(&candidate[start..end]));
        match longest {
            Some(end) => {
                out.push_str(&candidate[copied..start]);
                out.push_str(REDACTED);
                copied = end;
                start = end;
            }
            None => start += 1,
        }
    }
    out.push_str(&candidate[copied..]);
    out
}

/// Tera sources for each transition. Override to change the wording.
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    pub opened: String,
    pub repeat: String,
    pub recovered: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            opened: concat!(
                "🔴 {{ kind }} alert: {{ subject }}\n",
                "{% if measured %}Current: {{ measured }}{% if threshold %} (limit {{ threshold }}){% endif %}\n{% endif %}",
                "{% if failures %}Failed checks in a row: {{ failures }}\n{% endif %}",
                "{% if detail %}{{ detail }}\n{% endif %}",
                "Since: {{ opened_at }}",
            )
            .to_string(),
            repeat: concat!(
                "🔴 {{ kind }} alert still active: {{ subject }}\n",
                "{% if measured %}Current: {{ measured }}{% if threshold %} (limit {{ threshold }}){% endif %}\n{% endif %}",
                "{% if failures %}Failed checks in a row: {{ failures }}\n{% endif %}",
                "{% if detail %}{{ detail }}\n{% endif %}",
                "Since: {{ opened_at }} (notification #{{ count }})",
            )
            .to_string(),
            recovered: concat!(
                "✅ {{ kind }} recovered: {{ subject }}\n",
                "{% if measured %}Current: {{ measured }}\n{% endif %}",
                "Open since: {{ opened_at }}\n",
                "Recovered at: {{ at }}",
            )
            .to_string(),
        }
    }
}

/// Everything a message may mention. Hosts and agent URLs are deliberately
/// absent.
#[derive(Debug, Clone)]
pub struct MessageInput<'a> {
    pub subject: &'a Subject,
    pub kind: AlertKind,
    pub transition: Transition,
    pub measured: Option<f64>,
    pub threshold: Option<f64>,
    pub failures: Option<u32>,
    pub detail: Option<&'a str>,
    pub opened_at: DateTime<Utc>,
    pub at: DateTime<Utc>,
    pub notification_count: i32,
}

pub struct MessageRenderer {
    tera: Tera,
    mask: MaskPolicy,
}

impl MessageRenderer {
    pub fn new(mask: MaskPolicy) -> Result<Self> {
        Self::with_templates(mask, MessageTemplates::default())
    }

    pub fn with_templates(mask: MaskPolicy, templates: MessageTemplates) -> Result<Self> {
        let tera = compile_templates(&[
            ("opened.txt", templates.opened.as_str()),
            ("repeat.txt", templates.repeat.as_str()),
            ("recovered.txt", templates.recovered.as_str()),
        ])?;
        Ok(Self { tera, mask })
    }

    /// Name shown in messages: server names as-is, domains masked.
    pub fn display_name(&self, subject: &Subject) -> String {
        match subject.subject_type {
            SubjectType::Server => subject.name.clone(),
            SubjectType::Domain => self.mask.mask_domain(&subject.name),
        }
    }

    pub fn render(&self, input: &MessageInput<'_>) -> Result<String> {
        let template = match input.transition {
            Transition::Opened { repeat: false } => "opened.txt",
            Transition::Opened { repeat: true } => "repeat.txt",
            Transition::Recovered => "recovered.txt",
        };

        let percent = matches!(input.kind, AlertKind::Cpu | AlertKind::Memory | AlertKind::Disk);
        let format_value = |v: f64| {
            if percent {
                format!("{:.1}%", v)
            } else {
                format!("{}", v)
            }
        };

        let context = json!({
            "subject": self.display_name(input.subject),
            "subject_type": input.subject.subject_type.to_string(),
            "kind": input.kind.label(),
            "measured": input.measured.map(format_value),
            "threshold": input.threshold.map(format_value),
            "failures": input.failures,
            "detail": input.detail.map(scrub_ips),
            "opened_at": format_time(input.opened_at),
            "at": format_time(input.at),
            "count": input.notification_count,
        });

        let text = render_named(&self.tera, template, &context)?;
        Ok(scrub_ips(&text))
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn server_subject(name: &str) -> Subject {
        Subject {
            subject_type: SubjectType::Server,
            id: Uuid::new_v4(),
            name: name.to_string(),
        }
    }

    fn input<'a>(subject: &'a Subject, kind: AlertKind, transition: Transition) -> MessageInput<'a> {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        MessageInput {
            subject,
            kind,
            transition,
            measured: None,
            threshold: None,
            failures: None,
            detail: None,
            opened_at: at,
            at,
            notification_count: 1,
        }
    }

    #[test]
    fn test_scrub_ips() {
        assert_eq!(
            scrub_ips("connect to 10.0.0.5:61208 failed"),
            "connect to [redacted]:61208 failed"
        );
        assert_eq!(
            scrub_ips("url http://[2001:db8::1]:61208/api"),
            "url http://[[redacted]]:61208/api"
        );
        assert_eq!(scrub_ips("peer ::ffff:192.168.1.1."), "peer [redacted].");
        assert_eq!(scrub_ips("at 12:30:00 UTC"), "at 12:30:00 UTC");
        assert_eq!(scrub_ips("CPU 86.0%"), "CPU 86.0%");
    }

    #[test]
    fn test_resource_alert_message() {
        let subject = server_subject("edge-1");
        let mut msg = input(&subject, AlertKind::Cpu, Transition::Opened { repeat: false });
        msg.measured = Some(86.0);
        msg.threshold = Some(85.0);

        let renderer = MessageRenderer::new(MaskPolicy::default()).unwrap();
        let text = renderer.render(&msg).unwrap();
        assert!(text.contains("CPU alert: edge-1"));
        assert!(text.contains("Current: 86.0% (limit 85.0%)"));
        assert!(text.contains("Since: 2024-06-01 12:30 UTC"));
    }

    #[test]
    fn test_availability_message_has_no_ip_literals() {
        let renderer = MessageRenderer::new(MaskPolicy::default()).unwrap();

        for (name, literal) in [
            ("192.168.10.20", "192.168.10.20"),
            ("edge_10.0.0.5", "10.0.0.5"),
            ("srv10.0.0.5", "10.0.0.5"),
            ("cafe2001:db8::1", "2001:db8::1"),
            ("node-fd00::7b", "fd00::7b"),
        ] {
            let subject = server_subject(name);
            let mut msg =
                input(&subject, AlertKind::Availability, Transition::Opened { repeat: false });
            msg.failures = Some(3);
            msg.detail =
                Some("error sending request for url (http://[fd00::7]:61208/api/4/all) from 10.1.2.3");

            let text = renderer.render(&msg).unwrap();
            assert!(text.contains("Failed checks in a row: 3"));
            assert!(!text.contains(literal), "{} leaked: {}", literal, text);
            assert!(!text.contains("fd00::7"));
            assert!(!text.contains("10.1.2.3"));
            assert!(!IPV4.is_match(&text));
        }
    }

    #[test]
    fn test_scrub_ips_glued_to_words() {
        assert_eq!(scrub_ips("edge_10.0.0.5"), "edge_[redacted]");
        assert_eq!(scrub_ips("srv10.0.0.5"), "srv[redacted]");
        assert_eq!(scrub_ips("cafe2001:db8::1"), "cafe[redacted]");
        assert_eq!(scrub_ips("a 2001:db8::1 and fe80::1 b"), "a [redacted] and [redacted] b");
        assert_eq!(scrub_ips("release 2024-06-01 12:30 UTC"), "release 2024-06-01 12:30 UTC");
    }

    #[test]
    fn test_domain_subject_is_masked() {
        let subject = Subject {
            subject_type: SubjectType::Domain,
            id: Uuid::new_v4(),
            name: "example.com".to_string(),
        };
        let msg = input(&subject, AlertKind::Ns, Transition::Recovered);

        let renderer = MessageRenderer::new(MaskPolicy::default()).unwrap();
        let text = renderer.render(&msg).unwrap();
        assert!(text.contains("Nameservers recovered: exa****.com"));
        assert!(!text.contains("example"));
    }

    #[test]
    fn test_repeat_uses_its_own_template() {
        let subject = server_subject("edge-1");
        let mut msg = input(&subject, AlertKind::Disk, Transition::Opened { repeat: true });
        msg.notification_count = 4;

        let renderer = MessageRenderer::new(MaskPolicy::default()).unwrap();
        let text = renderer.render(&msg).unwrap();
        assert!(text.contains("still active"));
        assert!(text.contains("notification #4"));
    }

    #[test]
    fn test_custom_templates() {
        let templates = MessageTemplates {
            opened: "{{ kind }} DOWN {{ subject }}".into(),
            ..MessageTemplates::default()
        };
        let renderer = MessageRenderer::with_templates(MaskPolicy::default(), templates).unwrap();
        let subject = server_subject("edge-1");
        let msg = input(&subject, AlertKind::Availability, Transition::Opened { repeat: false });
        assert_eq!(renderer.render(&msg).unwrap(), "Availability DOWN edge-1");
    }
}
