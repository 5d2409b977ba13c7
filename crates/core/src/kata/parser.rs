//! # Kata Compiler
//!
//! Turns kata source text into a validated [`CompiledKata`].
//!
//! ```text
//! kata finance-audit v1
//! requires skill ledger.fetch
//! initial gather
//!
//! phase gather
//!   run skill ledger.fetch
//!   next analyze
//!
//! phase analyze
//!   run skill ledger.analyze
//!   retry 3 exponential 1s
//!   complete
//! ```
//!
//! All structural checks happen here: duplicate phases, the initial phase,
//! closure of `next` references and the terminal directive on every phase.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;
use std::time::Duration;

use super::error::{CompileError, Result};
use super::model::{CompiledKata, Phase, PhaseAction, RetrySetting, Transition};
use crate::engine::retry::{Backoff, RetryPolicy};

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:\-]+$").expect("static identifier regex"))
}

fn delay_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(ms|s|m)$").expect("static delay regex"))
}

/// Phase block being assembled
struct PhaseDraft {
    name: String,
    line: usize,
    action: Option<PhaseAction>,
    transition: Option<(Transition, usize)>,
    retry: Option<RetrySetting>,
}

#[derive(Default)]
struct Header {
    name: String,
    version: u32,
    required_skills: BTreeSet<String>,
    initial: Option<(String, usize)>,
    default_retry: Option<RetrySetting>,
}

/// Compile kata source text
pub fn compile(source: &str) -> Result<CompiledKata> {
    let mut lines = source
        .lines()
        .enumerate()
        .map(|(i, raw)| (i + 1, raw.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

    let (header_line, header_text) = lines.next().ok_or(CompileError::EmptySource)?;
    let mut header = parse_header(header_line, header_text)?;

    let mut phases: Vec<PhaseDraft> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (line, text) in lines {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let directive = tokens[0];

        match directive {
            "kata" => {
                return Err(CompileError::InvalidHeader {
                    line,
                    reason: "kata header declared more than once".to_string(),
                });
            }
            "requires" => {
                header_only(&phases, line, directive)?;
                let skill = expect_args(&tokens, line, &["skill"], 1, "requires skill <id>")?;
                header.required_skills.insert(identifier(skill[0], line)?);
            }
            "initial" => {
                header_only(&phases, line, directive)?;
                let args = expect_args(&tokens, line, &[], 1, "initial <phase>")?;
                if header.initial.is_some() {
                    return Err(CompileError::DuplicateInitial { line });
                }
                header.initial = Some((identifier(args[0], line)?, line));
            }
            "retry" => {
                let setting = parse_retry(&tokens[1..], line)?;
                match phases.last_mut() {
                    None if header.default_retry.is_some() => {
                        return Err(CompileError::InvalidRetryPolicy {
                            line,
                            reason: "kata default retry declared more than once".to_string(),
                        });
                    }
                    None => header.default_retry = Some(setting),
                    Some(draft) if draft.retry.is_some() => {
                        return Err(CompileError::InvalidRetryPolicy {
                            line,
                            reason: format!("phase '{}' already declares a retry policy", draft.name),
                        });
                    }
                    Some(draft) => draft.retry = Some(setting),
                }
            }
            "phase" => {
                let args = expect_args(&tokens, line, &[], 1, "phase <name>")?;
                let name = identifier(args[0], line)?;
                if let Some(&first) = seen.get(&name) {
                    return Err(CompileError::DuplicatePhase {
                        line,
                        phase: name,
                        first,
                    });
                }
                seen.insert(name.clone(), line);
                phases.push(PhaseDraft {
                    name,
                    line,
                    action: None,
                    transition: None,
                    retry: None,
                });
            }
            "run" | "spawn" | "await" => {
                let draft = current_phase(&mut phases, line, directive)?;
                let action = parse_action(&tokens, line)?;
                if draft.action.is_some() {
                    return Err(CompileError::MultipleActions {
                        line,
                        phase: draft.name.clone(),
                    });
                }
                if let PhaseAction::RunSkill { skill } = &action {
                    header.required_skills.insert(skill.clone());
                }
                draft.action = Some(action);
            }
            "next" | "complete" => {
                let draft = current_phase(&mut phases, line, directive)?;
                let transition = if directive == "next" {
                    let args = expect_args(&tokens, line, &[], 1, "next <phase>")?;
                    Transition::Next(identifier(args[0], line)?)
                } else {
                    expect_args(&tokens, line, &[], 0, "complete")?;
                    Transition::Complete
                };
                if draft.transition.is_some() {
                    return Err(CompileError::MultipleTerminals {
                        line,
                        phase: draft.name.clone(),
                    });
                }
                draft.transition = Some((transition, line));
            }
            other => {
                return Err(CompileError::UnknownDirective {
                    line,
                    directive: other.to_string(),
                });
            }
        }
    }

    link(header, phases)
}

/// Resolve references and freeze the graph
fn link(header: Header, drafts: Vec<PhaseDraft>) -> Result<CompiledKata> {
    if drafts.is_empty() {
        return Err(CompileError::NoPhases { kata: header.name });
    }

    let (initial, initial_line) = header.initial.ok_or(CompileError::MissingInitialPhase)?;
    if !drafts.iter().any(|d| d.name == initial) {
        return Err(CompileError::UnknownInitialPhase {
            line: initial_line,
            phase: initial,
        });
    }

    let mut phases = BTreeMap::new();
    for draft in &drafts {
        let (transition, line) = draft
            .transition
            .clone()
            .ok_or_else(|| CompileError::MissingTerminal {
                line: draft.line,
                phase: draft.name.clone(),
            })?;

        if let Transition::Next(target) = &transition {
            if !drafts.iter().any(|d| &d.name == target) {
                return Err(CompileError::UnknownPhaseReference {
                    line,
                    phase: draft.name.clone(),
                    target: target.clone(),
                });
            }
        }

        phases.insert(
            draft.name.clone(),
            Phase {
                name: draft.name.clone(),
                action: draft.action.clone(),
                transition,
                retry: draft.retry.clone(),
            },
        );
    }

    Ok(CompiledKata {
        name: header.name,
        version: header.version,
        required_skills: header.required_skills,
        phases,
        initial_phase: initial,
        default_retry: header.default_retry,
    })
}

fn parse_header(line: usize, text: &str) -> Result<Header> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.first() != Some(&"kata") {
        return Err(CompileError::MissingHeader { line });
    }
    if tokens.len() != 3 {
        return Err(CompileError::InvalidHeader {
            line,
            reason: format!("expected `kata <name> v<version>`, got '{}'", text),
        });
    }

    Ok(Header {
        name: identifier(tokens[1], line)?,
        version: parse_version(tokens[2], line)?,
        ..Header::default()
    })
}

fn parse_version(token: &str, line: usize) -> Result<u32> {
    token
        .strip_prefix('v')
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| CompileError::InvalidVersion {
            line,
            value: token.to_string(),
        })
}

fn parse_action(tokens: &[&str], line: usize) -> Result<PhaseAction> {
    match tokens[0] {
        "run" => {
            let args = expect_args(tokens, line, &["skill"], 1, "run skill <id>")?;
            Ok(PhaseAction::RunSkill {
                skill: identifier(args[0], line)?,
            })
        }
        "spawn" => {
            let args = expect_args(tokens, line, &["kata"], 2, "spawn kata <name> v<version>")?;
            Ok(PhaseAction::SpawnKata {
                kata: identifier(args[0], line)?,
                version: parse_version(args[1], line)?,
            })
        }
        _ => {
            let args = expect_args(tokens, line, &["event"], 1, "await event <name>")?;
            Ok(PhaseAction::AwaitEvent {
                event: identifier(args[0], line)?,
            })
        }
    }
}

fn parse_retry(args: &[&str], line: usize) -> Result<RetrySetting> {
    let invalid = |reason: String| CompileError::InvalidRetryPolicy { line, reason };

    match args {
        ["none"] => Ok(RetrySetting::Policy(RetryPolicy::none())),
        ["default"] => Ok(RetrySetting::EngineDefault),
        [attempts, curve, delay] => {
            let attempts: u32 = attempts
                .parse()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| invalid(format!("attempts must be a positive integer, got '{}'", attempts)))?;
            let backoff = Backoff::parse(curve).ok_or_else(|| {
                invalid(format!(
                    "unknown backoff '{}', expected fixed, linear or exponential",
                    curve
                ))
            })?;
            let delay = parse_delay(delay)
                .ok_or_else(|| invalid(format!("invalid delay '{}', expected e.g. 500ms, 5s, 2m", delay)))?;
            Ok(RetrySetting::Policy(RetryPolicy::new(attempts, backoff, delay)))
        }
        _ => Err(invalid(
            "expected `retry none`, `retry default` or `retry <attempts> <fixed|linear|exponential> <delay>`"
                .to_string(),
        )),
    }
}

fn parse_delay(token: &str) -> Option<Duration> {
    let caps = delay_re().captures(token)?;
    let value: u64 = caps[1].parse().ok()?;
    match &caps[2] {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value.checked_mul(60)?)),
        _ => None,
    }
}

/// Check keyword tokens after the directive and return the remaining `count` arguments
fn expect_args<'a>(
    tokens: &'a [&'a str],
    line: usize,
    keywords: &[&str],
    count: usize,
    expected: &'static str,
) -> Result<&'a [&'a str]> {
    let malformed = || CompileError::MalformedDirective {
        line,
        directive: tokens[0].to_string(),
        expected,
    };

    let rest = &tokens[1..];
    if rest.len() != keywords.len() + count {
        return Err(malformed());
    }
    if rest.iter().zip(keywords).any(|(tok, kw)| tok != kw) {
        return Err(malformed());
    }
    Ok(&rest[keywords.len()..])
}

fn identifier(token: &str, line: usize) -> Result<String> {
    if identifier_re().is_match(token) {
        Ok(token.to_string())
    } else {
        Err(CompileError::InvalidIdentifier {
            line,
            value: token.to_string(),
        })
    }
}

fn header_only(phases: &[PhaseDraft], line: usize, directive: &str) -> Result<()> {
    if phases.is_empty() {
        Ok(())
    } else {
        Err(CompileError::HeaderDirectiveInPhase {
            line,
            directive: directive.to_string(),
        })
    }
}

fn current_phase<'a>(
    phases: &'a mut [PhaseDraft],
    line: usize,
    directive: &str,
) -> Result<&'a mut PhaseDraft> {
    phases
        .last_mut()
        .ok_or_else(|| CompileError::DirectiveOutsidePhase {
            line,
            directive: directive.to_string(),
        })
}
