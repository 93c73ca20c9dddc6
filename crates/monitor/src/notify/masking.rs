use serde::{Deserialize, Serialize};

/// How domain names are obscured in outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskPolicy {
    pub visible_prefix: usize,
    pub mask_char: char,
    /// Keep the last label (TLD) readable.
    pub keep_suffix: bool,
}

impl Default for MaskPolicy {
    fn default() -> Self {
        Self {
            visible_prefix: 3,
            mask_char: '*',
            keep_suffix: true,
        }
    }
}

impl MaskPolicy {
    /// `example.com` becomes `exa****.com` with the default policy. The
    /// masked part never shows all of its characters.
    pub fn mask_domain(&self, domain: &str) -> String {
        let domain = domain.trim().trim_end_matches('.');

        let (body, suffix) = match domain.rsplit_once('.') {
            Some((body, tld)) if self.keep_suffix && !body.is_empty() => (body, Some(tld)),
            _ => (domain, None),
        };

        let len = body.chars().count();
        let visible = self.visible_prefix.min(len.saturating_sub(1));

        let mut masked: String = body.chars().take(visible).collect();
        masked.extend(std::iter::repeat(self.mask_char).take(len - visible));

        if let Some(tld) = suffix {
            masked.push('.');
            masked.push_str(tld);
        }
        masked
    }
}
