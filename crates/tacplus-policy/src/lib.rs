// SPDX-License-Identifier: AGPL-3.0-only
//! Policy sections for the virtual server.
//!
//! A policy document declares the `recv`/`process`/`send` sections the
//! session machine dispatches into, as JSON. Every section present is
//! compiled once at startup; a section that fails to compile aborts startup
//! with a diagnostic naming it. The interpreter here is synchronous and never
//! yields; the machine's yield handling is exercised by asynchronous backends
//! behind the same trait.

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, JSONSchema};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tacplus_core::{
    Hook, Interpretation, Outcome, PolicyRunner, Request, ScheduledSection, SectionId, SessionData,
};
use tacplus_proto::decode::authen_data;
use tacplus_proto::dict::{acct_status, authen_status, author_status};
use tacplus_proto::{Attr, AuthTypes, AuthenData, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDocument {
    /// Static user:password pairs for PAP verification.
    #[serde(default)]
    pub users: HashMap<String, String>,
    pub sections: Vec<SectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionConfig {
    pub hook: HookConfig,
    pub name: String,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HookConfig {
    Recv,
    Process,
    Send,
}

impl From<HookConfig> for Hook {
    fn from(hook: HookConfig) -> Hook {
        match hook {
            HookConfig::Recv => Hook::Recv,
            HookConfig::Process => Hook::Process,
            HookConfig::Send => Hook::Send,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionConfig {
    /// Set `Auth-Type` in the control list, dispatching a `process` section.
    SetAuthType { value: String },
    /// Update an attribute in the reply.
    Reply { attr: String, value: String },
    /// Update an attribute in the control list.
    Control { attr: String, value: String },
    /// Update an attribute in the conversation's session-state.
    SessionState { attr: String, value: String },
    /// Verify a PAP password against the static user table.
    VerifyPap,
    /// Reject unless the user name matches the pattern.
    RequireUserMatch { pattern: String },
    /// Finish the section with an explicit outcome.
    Return { outcome: String },
}

#[derive(Debug)]
enum Action {
    SetControl(Attr, Value),
    Reply(Attr, Value),
    SessionState(Attr, Value),
    VerifyPap,
    RequireUserMatch(Regex),
    Return(Outcome),
}

#[derive(Debug)]
struct Section {
    hook: Hook,
    name: String,
    actions: Vec<Action>,
}

#[derive(Debug)]
pub struct PolicyEngine {
    sections: Vec<Section>,
    users: HashMap<String, String>,
    auth_types: AuthTypes,
}

fn parse_outcome(name: &str) -> Result<Outcome> {
    Ok(match name {
        "reject" => Outcome::Reject,
        "fail" => Outcome::Fail,
        "ok" => Outcome::Ok,
        "handled" => Outcome::Handled,
        "invalid" => Outcome::Invalid,
        "userlock" => Outcome::Userlock,
        "notfound" => Outcome::Notfound,
        "noop" => Outcome::Noop,
        "updated" => Outcome::Updated,
        other => bail!("unknown outcome '{other}'"),
    })
}

/// Turn a configured string into a typed value for the target attribute,
/// resolving status enum aliases where the attribute calls for them.
fn value_for_attr(attr: Attr, raw: &str) -> Result<Value> {
    let enum_value = match attr {
        Attr::AuthenticationStatus => authen_status::from_alias(raw),
        Attr::AuthorizationStatus => author_status::from_alias(raw),
        Attr::AccountingStatus => acct_status::from_alias(raw),
        _ => return Ok(Value::Str(raw.to_string())),
    };
    enum_value
        .map(Value::U8)
        .or_else(|| raw.parse::<u8>().ok().map(Value::U8))
        .ok_or_else(|| anyhow!("'{raw}' is not a valid value for {}", attr.name()))
}

fn attr_by_name(name: &str) -> Result<Attr> {
    Attr::from_name(name).ok_or_else(|| anyhow!("unknown attribute '{name}'"))
}

impl PolicyEngine {
    pub fn from_path(policy: impl AsRef<Path>, schema: Option<impl AsRef<Path>>) -> Result<Self> {
        let policy_path = policy.as_ref();
        let contents = fs::read_to_string(policy_path)
            .with_context(|| format!("reading policy {}", policy_path.display()))?;
        let value: JsonValue = serde_json::from_str(&contents)
            .with_context(|| format!("parsing JSON policy {}", policy_path.display()))?;

        if let Some(schema_path) = schema {
            validate_against_schema(&value, schema_path.as_ref())?;
        }

        let document: PolicyDocument = serde_json::from_value(value)
            .with_context(|| format!("deserializing policy {}", policy_path.display()))?;
        Self::from_document(document)
    }

    pub fn from_document(document: PolicyDocument) -> Result<Self> {
        let mut auth_types = AuthTypes::new();
        let mut sections = Vec::with_capacity(document.sections.len());

        for config in document.sections {
            let hook = Hook::from(config.hook);
            if hook == Hook::Process {
                auth_types.register(&config.name);
            }
            let section = compile_section(hook, config)?;
            debug!(name = %section.name, "compiled policy section");
            sections.push(section);
        }

        let engine = PolicyEngine {
            sections,
            users: document.users,
            auth_types,
        };

        // Every packet family needs its recv/send pair compiled up front.
        for hook in [Hook::Recv, Hook::Send] {
            for name in ["Authentication", "Authorization", "Accounting"] {
                if engine.find(hook, name).is_none() && engine.find(hook, "*").is_none() {
                    bail!(
                        "failed finding '{} {}' section of virtual server",
                        hook_name(hook),
                        name
                    );
                }
            }
        }

        Ok(engine)
    }

    pub fn auth_types(&self) -> &AuthTypes {
        &self.auth_types
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    fn find(&self, hook: Hook, name: &str) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|s| s.hook == hook && s.name == name)
            .map(SectionId)
    }

    fn verify_pap(&self, request: &mut Request) -> Outcome {
        let Some(user) = request.packet.attrs.find_str(Attr::UserName) else {
            debug!("no user name in request, rejecting");
            return Outcome::Reject;
        };
        let AuthenData::Pap { password } = authen_data(&request.packet.attrs) else {
            debug!("request carries no PAP password, rejecting");
            return Outcome::Reject;
        };
        match self.users.get(user) {
            Some(expected) if *expected == password => Outcome::Ok,
            Some(_) => {
                debug!(user, "PAP password mismatch");
                Outcome::Reject
            }
            None => {
                debug!(user, "unknown user");
                Outcome::Notfound
            }
        }
    }
}

fn hook_name(hook: Hook) -> &'static str {
    match hook {
        Hook::Recv => "recv",
        Hook::Process => "process",
        Hook::Send => "send",
    }
}

fn compile_section(hook: Hook, config: SectionConfig) -> Result<Section> {
    let label = format!("{} {}", hook_name(hook), config.name);
    let mut actions = Vec::with_capacity(config.actions.len());
    for action in config.actions {
        let compiled = compile_action(action)
            .with_context(|| format!("compiling '{label}' section"))?;
        actions.push(compiled);
    }
    Ok(Section {
        hook,
        name: config.name,
        actions,
    })
}

fn compile_action(action: ActionConfig) -> Result<Action> {
    Ok(match action {
        ActionConfig::SetAuthType { value } => {
            // The value is resolved against the Auth-Type table at run time;
            // store the alias as a control attribute template.
            Action::SetControl(Attr::AuthType, Value::Str(value))
        }
        ActionConfig::Reply { attr, value } => {
            let attr = attr_by_name(&attr)?;
            Action::Reply(attr, value_for_attr(attr, &value)?)
        }
        ActionConfig::Control { attr, value } => {
            let attr = attr_by_name(&attr)?;
            Action::SetControl(attr, value_for_attr(attr, &value)?)
        }
        ActionConfig::SessionState { attr, value } => {
            let attr = attr_by_name(&attr)?;
            Action::SessionState(attr, value_for_attr(attr, &value)?)
        }
        ActionConfig::VerifyPap => Action::VerifyPap,
        ActionConfig::RequireUserMatch { pattern } => {
            let regex = Regex::new(&pattern)
                .with_context(|| format!("compiling pattern {pattern:?}"))?;
            Action::RequireUserMatch(regex)
        }
        ActionConfig::Return { outcome } => Action::Return(parse_outcome(&outcome)?),
    })
}

impl PolicyRunner for PolicyEngine {
    fn find_section(&self, hook: Hook, name: &str) -> Option<SectionId> {
        self.find(hook, name)
    }

    fn push_section(&self, request: &mut Request, section: SectionId, default: Outcome) {
        request.scheduled = Some(ScheduledSection { section, default });
    }

    fn resume(&self, request: &mut Request) -> Interpretation {
        let Some(scheduled) = request.scheduled.take() else {
            warn!("resume without a scheduled section");
            return Interpretation::Done(Outcome::Noop);
        };
        let section = &self.sections[scheduled.section.0];

        // Attribute writes mark the section `updated` unless something more
        // specific (a verifier or an explicit return) already decided.
        let mut rcode: Option<Outcome> = None;
        for action in &section.actions {
            match action {
                Action::SetControl(Attr::AuthType, Value::Str(alias)) => {
                    // Unknown aliases flow through as-is; the machine rejects
                    // unresolvable Auth-Types itself.
                    let value = self.auth_types.value(alias).unwrap_or(u32::MAX);
                    request.control.add(Attr::AuthType, Value::U32(value));
                    rcode.get_or_insert(Outcome::Updated);
                }
                Action::SetControl(attr, value) => {
                    request.control.update(*attr, value.clone());
                    rcode.get_or_insert(Outcome::Updated);
                }
                Action::Reply(attr, value) => {
                    request.reply.attrs.update(*attr, value.clone());
                    rcode.get_or_insert(Outcome::Updated);
                }
                Action::SessionState(attr, value) => {
                    request
                        .session_state
                        .get_or_insert_with(SessionData::default)
                        .vps
                        .update(*attr, value.clone());
                    rcode.get_or_insert(Outcome::Updated);
                }
                Action::VerifyPap => {
                    rcode = Some(self.verify_pap(request));
                }
                Action::RequireUserMatch(regex) => {
                    let matched = request
                        .packet
                        .attrs
                        .find_str(Attr::UserName)
                        .map(|user| regex.is_match(user))
                        .unwrap_or(false);
                    if !matched {
                        rcode = Some(Outcome::Reject);
                        break;
                    }
                }
                Action::Return(outcome) => {
                    rcode = Some(*outcome);
                    break;
                }
            }
        }

        Interpretation::Done(rcode.unwrap_or(scheduled.default))
    }
}

fn validate_against_schema(value: &JsonValue, schema_path: &Path) -> Result<()> {
    let contents = fs::read_to_string(schema_path)
        .with_context(|| format!("reading schema {}", schema_path.display()))?;
    let schema: JsonValue = serde_json::from_str(&contents)
        .with_context(|| format!("parsing schema {}", schema_path.display()))?;
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|e| anyhow!("compiling schema {}: {e}", schema_path.display()))?;
    if let Err(errors) = compiled.validate(value) {
        let details: Vec<String> = errors.map(|e| e.to_string()).collect();
        bail!("policy failed schema validation: {}", details.join("; "));
    }
    Ok(())
}

/// Validate a policy file (plus optional schema) without building an engine.
pub fn validate_policy(policy: impl AsRef<Path>, schema: Option<impl AsRef<Path>>) -> Result<()> {
    PolicyEngine::from_path(policy, schema).map(|_| ())
}
