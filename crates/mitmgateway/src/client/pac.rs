//! Proxy auto-configuration.
//!
//! The PAC script is fetched once per request so configuration changes take
//! effect on the next request, mirroring the system-proxy resolver. There is
//! no JavaScript engine here: the evaluator covers the subset of
//! `FindProxyForURL` bodies seen in real deployments — unconditional returns
//! and single-condition `dnsDomainIs`/`shExpMatch` guards. Scripts outside
//! that subset fail the request as upstream-unavailable rather than being
//! silently misread.

use url::Url;

use crate::client::Client;
use crate::proxy::ProxyError;

#[cfg(test)]
#[path = "pac_tests.rs"]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacDirective {
	Direct,
	Proxy(Url),
	Socks(Url),
}

#[derive(thiserror::Error, Debug)]
pub enum PacError {
	#[error("script has no FindProxyForURL function")]
	MissingFunction,

	#[error("unsupported construct: {0}")]
	Unsupported(String),

	#[error("no return statement matched")]
	NoMatch,

	#[error("directive list is empty or unusable: {0}")]
	BadDirective(String),
}

/// Fetch and evaluate the PAC policy for one request, returning the first
/// usable directive.
pub(super) async fn select(
	client: &Client,
	pac_url: &Url,
	url: &str,
	host: &str,
) -> Result<PacDirective, ProxyError> {
	let script = client.fetch_text(pac_url).await?;
	let directive = evaluate(&script, url, host)
		.and_then(|ret| first_directive(&ret))
		.map_err(|e| ProxyError::UpstreamUnavailable(format!("pac {pac_url}: {e}")))?;
	Ok(directive)
}

/// Evaluate `FindProxyForURL(url, host)` and return its string result.
pub(crate) fn evaluate(script: &str, url: &str, host: &str) -> Result<String, PacError> {
	let body = function_body(script).ok_or(PacError::MissingFunction)?;

	for raw in split_statements(&body) {
		let mut statement = raw.trim();
		// Brace blocks and else-chains reduce to their guarded returns.
		while let Some(rest) = statement.strip_prefix('}') {
			statement = rest.trim_start();
		}
		if let Some(rest) = statement.strip_prefix("else") {
			statement = rest.trim_start();
		}
		if let Some(rest) = statement.strip_prefix('{') {
			statement = rest.trim_start();
		}
		if statement.is_empty() {
			continue;
		}
		if let Some(rest) = statement.strip_prefix("if") {
			let rest = rest.trim_start();
			let (condition, tail) = take_parenthesized(rest)
				.ok_or_else(|| PacError::Unsupported(statement.to_string()))?;
			let mut tail = tail.trim_start();
			if let Some(rest) = tail.strip_prefix('{') {
				tail = rest.trim_start();
			}
			let ret =
				return_literal(tail).ok_or_else(|| PacError::Unsupported(statement.to_string()))?;
			if eval_condition(&condition, url, host)? {
				return Ok(ret);
			}
		} else if let Some(ret) = return_literal(statement) {
			return Ok(ret);
		} else {
			return Err(PacError::Unsupported(statement.to_string()));
		}
	}
	Err(PacError::NoMatch)
}

/// Parse a `PROXY host:port; SOCKS host:port; DIRECT` list and return the
/// first entry that parses. Unknown keywords are skipped so a partially
/// exotic list still yields its usable tail.
pub(crate) fn parse_directives(list: &str) -> Vec<PacDirective> {
	let mut out = Vec::new();
	for entry in list.split(';') {
		let entry = entry.trim();
		if entry.is_empty() {
			continue;
		}
		let (keyword, addr) = match entry.split_once(char::is_whitespace) {
			Some((k, a)) => (k, a.trim()),
			None => (entry, ""),
		};
		let parsed = match keyword.to_ascii_uppercase().as_str() {
			"DIRECT" => Some(PacDirective::Direct),
			"PROXY" | "HTTP" => Url::parse(&format!("http://{addr}")).ok().map(PacDirective::Proxy),
			"HTTPS" => Url::parse(&format!("https://{addr}"))
				.ok()
				.map(PacDirective::Proxy),
			"SOCKS" | "SOCKS5" => Url::parse(&format!("socks://{addr}"))
				.ok()
				.map(PacDirective::Socks),
			_ => None,
		};
		if let Some(directive) = parsed {
			out.push(directive);
		}
	}
	out
}

fn first_directive(ret: &str) -> Result<PacDirective, PacError> {
	parse_directives(ret)
		.into_iter()
		.next()
		.ok_or_else(|| PacError::BadDirective(ret.to_string()))
}

/// Shell-expression match as PAC defines it: `*` matches any run, `?` one
/// character, everything else is literal. Case-insensitive like browsers.
pub(crate) fn shexp_match(text: &str, pattern: &str) -> bool {
	fn inner(text: &[u8], pattern: &[u8]) -> bool {
		match (pattern.first(), text.first()) {
			(None, None) => true,
			(None, Some(_)) => false,
			(Some(b'*'), _) => {
				inner(text, &pattern[1..]) || (!text.is_empty() && inner(&text[1..], pattern))
			},
			(Some(b'?'), Some(_)) => inner(&text[1..], &pattern[1..]),
			(Some(p), Some(t)) if p == t => inner(&text[1..], &pattern[1..]),
			_ => false,
		}
	}
	inner(
		text.to_ascii_lowercase().as_bytes(),
		pattern.to_ascii_lowercase().as_bytes(),
	)
}

fn eval_condition(condition: &str, url: &str, host: &str) -> Result<bool, PacError> {
	let condition = condition.trim();
	let (name, args) = match condition.split_once('(') {
		Some((name, rest)) if rest.ends_with(')') => {
			(name.trim(), &rest[..rest.len() - 1])
		},
		_ => return Err(PacError::Unsupported(condition.to_string())),
	};
	let mut parts = args.splitn(2, ',');
	let subject = parts
		.next()
		.map(str::trim)
		.ok_or_else(|| PacError::Unsupported(condition.to_string()))?;
	let literal = parts
		.next()
		.and_then(|p| unquote(p.trim()))
		.ok_or_else(|| PacError::Unsupported(condition.to_string()))?;
	let subject = match subject {
		"host" => host,
		"url" => url,
		_ => return Err(PacError::Unsupported(condition.to_string())),
	};
	match name {
		"dnsDomainIs" => Ok(subject.to_ascii_lowercase().ends_with(&literal.to_ascii_lowercase())),
		"shExpMatch" => Ok(shexp_match(subject, &literal)),
		_ => Err(PacError::Unsupported(condition.to_string())),
	}
}

/// Extract the body of `FindProxyForURL`, comments stripped.
fn function_body(script: &str) -> Option<String> {
	let stripped: String = script
		.lines()
		.map(|line| match line.find("//") {
			Some(idx) => &line[..idx],
			None => line,
		})
		.collect::<Vec<_>>()
		.join("\n");

	let start = stripped.find("function")?;
	let after = &stripped[start..];
	if !after.contains("FindProxyForURL") {
		return None;
	}
	let open = after.find('{')?;
	let mut depth = 0usize;
	for (idx, ch) in after[open..].char_indices() {
		match ch {
			'{' => depth += 1,
			'}' => {
				depth -= 1;
				if depth == 0 {
					return Some(after[open + 1..open + idx].to_string());
				}
			},
			_ => {},
		}
	}
	None
}

/// Split on `;` outside of string literals.
fn split_statements(body: &str) -> Vec<String> {
	let mut out = Vec::new();
	let mut current = String::new();
	let mut in_string = false;
	for ch in body.chars() {
		match ch {
			'"' => {
				in_string = !in_string;
				current.push(ch);
			},
			';' if !in_string => {
				out.push(std::mem::take(&mut current));
			},
			_ => current.push(ch),
		}
	}
	if !current.trim().is_empty() {
		out.push(current);
	}
	out
}

/// `(...)` with balanced parentheses; returns the inside and the tail.
fn take_parenthesized(input: &str) -> Option<(String, &str)> {
	let mut depth = 0usize;
	let open = input.find('(')?;
	for (idx, ch) in input[open..].char_indices() {
		match ch {
			'(' => depth += 1,
			')' => {
				depth -= 1;
				if depth == 0 {
					return Some((
						input[open + 1..open + idx].to_string(),
						&input[open + idx + 1..],
					));
				}
			},
			_ => {},
		}
	}
	None
}

fn return_literal(statement: &str) -> Option<String> {
	let rest = statement.trim().strip_prefix("return")?;
	unquote(rest.trim())
}

fn unquote(value: &str) -> Option<String> {
	let value = value.trim().trim_end_matches(';').trim();
	if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
		Some(value[1..value.len() - 1].to_string())
	} else {
		None
	}
}
