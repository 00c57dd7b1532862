//! PII redaction for free-text telemetry and trace details.

/// Default cap applied to persisted detail strings.
pub const DEFAULT_DETAIL_MAX_CHARS: usize = 500;

const PHONE_MIN_DIGITS: usize = 7;
const REDACTED_PHONE: &str = "[phone]";
const REDACTED_EMAIL: &str = "[email]";
const TRUNCATION_MARKER: &str = "...";

/// Redacts phone-like digit runs and email addresses, then caps the result to
/// `max_chars` characters.
pub fn redact_detail(raw: &str, max_chars: usize) -> String {
    let redacted = raw
        .split_inclusive(char::is_whitespace)
        .map(redact_token)
        .collect::<String>();
    truncate_chars(redacted.trim(), max_chars)
}

fn redact_token(token: &str) -> String {
    let body = token.trim_end();
    let trailing = &token[body.len()..];
    if looks_like_email(body) {
        return format!("{REDACTED_EMAIL}{trailing}");
    }
    let mut output = String::with_capacity(token.len());
    let mut run = String::new();
    let mut run_digits = 0usize;
    for ch in body.chars() {
        let joins_run = ch.is_ascii_digit() || (!run.is_empty() && matches!(ch, '-' | '.' | '(' | ')'));
        if ch == '+' && run.is_empty() {
            run.push(ch);
            continue;
        }
        if joins_run {
            if ch.is_ascii_digit() {
                run_digits += 1;
            }
            run.push(ch);
            continue;
        }
        flush_run(&mut output, &mut run, &mut run_digits);
        output.push(ch);
    }
    flush_run(&mut output, &mut run, &mut run_digits);
    output.push_str(trailing);
    output
}

fn flush_run(output: &mut String, run: &mut String, run_digits: &mut usize) {
    if *run_digits >= PHONE_MIN_DIGITS {
        output.push_str(REDACTED_PHONE);
    } else {
        output.push_str(run);
    }
    run.clear();
    *run_digits = 0;
}

fn looks_like_email(token: &str) -> bool {
    let Some((local, domain)) = token.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.len());
    let mut truncated = value.chars().take(keep).collect::<String>();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
