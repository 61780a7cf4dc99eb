use crate::email::provider::RawMessage;

/// Reply/forward markers stripped during subject normalization, including
/// the German and Finnish locale variants the product supports.
const REPLY_PREFIXES: &[&str] = &["re:", "fwd:", "fw:", "aw:", "vs:"];

/// Normalize a subject for thread grouping: lowercase, trim, and strip
/// leading reply/forward markers repeatedly until none remain. Idempotent.
pub fn normalize_subject(subject: &str) -> String {
    let mut normalized = subject.to_lowercase().trim().to_string();

    loop {
        let mut stripped = false;
        for prefix in REPLY_PREFIXES {
            if let Some(rest) = normalized.strip_prefix(prefix) {
                normalized = rest.trim().to_string();
                stripped = true;
                break;
            }
        }
        if !stripped {
            return normalized;
        }
    }
}

/// Deterministic grouping key for a message: normalized subject plus the
/// sorted, deduplicated participant set. Any worker recomputing this on
/// the same inputs gets the same key, with no coordination.
pub fn thread_key(message: &RawMessage) -> String {
    let subject = normalize_subject(message.subject.as_deref().unwrap_or(""));

    let mut participants: Vec<String> = std::iter::once(&message.from_address)
        .chain(message.to_addresses.iter())
        .map(|a| a.to_lowercase())
        .collect();
    participants.sort();
    participants.dedup();

    format!("{}|{}", subject, participants.join(","))
}

/// Candidate thread id for a message. Non-cryptographic 32-bit string
/// hash rendered in base 36 — a collision only affects grouping, never
/// message identity.
///
/// Known limitation: two unrelated conversations reusing an old subject
/// line with the same participant set will merge. There is deliberately
/// no time-window disambiguation; changing that would regroup existing
/// threads under users' feet.
pub fn candidate_thread_id(message: &RawMessage) -> String {
    hash_string(&thread_key(message))
}

fn hash_string(s: &str) -> String {
    let mut hash: i32 = 0;
    for c in s.chars() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(c as i32);
    }
    to_base36(hash.unsigned_abs())
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(subject: &str, from: &str, to: &[&str]) -> RawMessage {
        RawMessage {
            external_id: "x".into(),
            subject: Some(subject.into()),
            body_preview: None,
            body_html: None,
            from_address: from.into(),
            to_addresses: to.iter().map(|s| s.to_string()).collect(),
            cc_addresses: vec![],
            has_attachments: false,
            sent_at: Utc::now(),
            received_at: None,
            is_read: false,
            provider_thread_id: None,
        }
    }

    #[test]
    fn test_normalize_strips_repeated_prefixes() {
        assert_eq!(normalize_subject("Re: Re: Hello"), "hello");
        assert_eq!(normalize_subject("Fwd: RE: fw: Budget"), "budget");
        assert_eq!(normalize_subject("  Hello  "), "hello");
        assert_eq!(normalize_subject("AW: Termin"), "termin");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for subject in ["Re: Re: Hello", "plain", "", "RE:RE:x", "fwd: vs: Re: a"] {
            let once = normalize_subject(subject);
            assert_eq!(normalize_subject(&once), once, "subject: {:?}", subject);
        }
    }

    #[test]
    fn test_normalize_keeps_interior_markers() {
        assert_eq!(normalize_subject("Update re: budget"), "update re: budget");
    }

    #[test]
    fn test_thread_id_stable_across_direction() {
        // Same conversation seen from both sides: reply swaps from/to but
        // the participant set is identical.
        let m1 = message("Project kickoff", "alice@x.com", &["bob@y.com"]);
        let m2 = message("Re: Project kickoff", "bob@y.com", &["alice@x.com"]);
        assert_eq!(candidate_thread_id(&m1), candidate_thread_id(&m2));
    }

    #[test]
    fn test_thread_id_case_insensitive_participants() {
        let m1 = message("Hi", "Alice@X.com", &["BOB@y.com"]);
        let m2 = message("hi", "alice@x.com", &["bob@y.com"]);
        assert_eq!(candidate_thread_id(&m1), candidate_thread_id(&m2));
    }

    #[test]
    fn test_thread_id_differs_on_participants() {
        let m1 = message("Hi", "alice@x.com", &["bob@y.com"]);
        let m2 = message("Hi", "alice@x.com", &["carol@z.com"]);
        assert_ne!(candidate_thread_id(&m1), candidate_thread_id(&m2));
    }

    #[test]
    fn test_participants_deduplicated() {
        let m1 = message("Hi", "alice@x.com", &["bob@y.com", "bob@y.com"]);
        let m2 = message("Hi", "alice@x.com", &["bob@y.com"]);
        assert_eq!(thread_key(&m1), thread_key(&m2));
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
