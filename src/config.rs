//! Configuration for modelmux.
//!
//! The YAML document is deserialized with serde, then `finalize()` expands
//! `${NAME}` macros (including the reserved `PORT` and `MODEL_ID`), builds
//! the alias table, assigns every model to exactly one group, and validates
//! the invariants the rest of the system relies on. The core only ever sees
//! a finalized `Config`.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Name of the synthetic group that collects models without an explicit group.
pub const DEFAULT_GROUP: &str = "(default)";

/// Sentinel `checkEndpoint` value that disables the health gate.
pub const NO_CHECK_ENDPOINT: &str = "none";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address the proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Prometheus metrics port (0 to disable).
    #[serde(default)]
    pub metrics_port: u16,

    /// Total seconds a backend may spend in the health gate. Values below
    /// 15 are raised to 15 with a warning.
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,

    /// First port handed out by the `${PORT}` macro.
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// User-defined macros, substitutable as `${NAME}` in model fields.
    #[serde(default)]
    pub macros: HashMap<String, String>,

    /// Models to manage.
    pub models: HashMap<String, ModelConfig>,

    /// Exclusivity groups. Models not named by any group join `(default)`.
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,

    /// Lifecycle hooks.
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Alias -> model id table, computed by `finalize()`.
    #[serde(skip)]
    pub aliases: HashMap<String, String>,
}

/// Configuration for a single model.
///
/// ```yaml
/// models:
///   llama-8b:
///     cmd: llama-server --port ${PORT} -m /models/llama-8b.gguf
///     checkEndpoint: /health
///     unloadAfter: 600
///     aliases: [llama]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Command that starts the backend. Either a single string (tokenised
    /// respecting quotes) or an argv array used as-is.
    pub cmd: CommandLine,

    /// Optional stop command template; `${PID}` is substituted at stop time
    /// and the result runs via `sh -c`. Without it the backend gets SIGTERM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_stop: Option<String>,

    /// Upstream base URL. Defaults to `http://localhost:${PORT}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Health probe path, or `none` to mark the backend ready right after
    /// the spawn settle delay.
    #[serde(default = "default_check_endpoint")]
    pub check_endpoint: String,

    /// Extra `K=V` environment entries layered over the parent environment.
    #[serde(default)]
    pub env: Vec<String>,

    /// Idle seconds before the backend is stopped. 0 disables eviction.
    #[serde(default)]
    pub unload_after: u64,

    /// Alternate request names resolving to this model.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Rewrite the `model` field of forwarded request bodies to this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_model_name: Option<String>,

    /// Request body rewrites applied before forwarding.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Hide this model from `/v1/models`.
    #[serde(default)]
    pub unlisted: bool,
}

/// A command line, either pre-tokenised or a single string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl ModelConfig {
    /// The tokenised argv. Only valid after `Config::finalize()`.
    pub fn argv(&self) -> &[String] {
        match &self.cmd {
            CommandLine::Argv(v) => v,
            CommandLine::Line(_) => &[],
        }
    }

    /// Upstream base URL. Only valid after `Config::finalize()`.
    pub fn upstream(&self) -> &str {
        self.proxy.as_deref().unwrap_or("")
    }

    /// Whether the health gate is disabled for this model.
    pub fn no_health_check(&self) -> bool {
        self.check_endpoint == NO_CHECK_ENDPOINT
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    /// JSON body keys removed before forwarding.
    #[serde(default)]
    pub strip_params: Vec<String>,
}

/// Exclusivity policy for a set of models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    /// Model ids in this group, in activation-preference order.
    pub members: Vec<String>,

    /// Only one member may be ready at a time; activating a different
    /// member stops the previous one first.
    #[serde(default = "default_true")]
    pub swap: bool,

    /// Activating any member stops every other non-persistent group.
    #[serde(default = "default_true")]
    pub exclusive: bool,

    /// Never stopped by activations in other groups, and never stops them.
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_startup: StartupHooks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupHooks {
    /// Models activated (in order) once the listener is up.
    #[serde(default)]
    pub preload: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_health_check_timeout() -> u64 {
    120
}

fn default_start_port() -> u16 {
    5800
}

fn default_check_endpoint() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and finalize a YAML config file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.finalize()?;
        Ok(config)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout)
    }

    /// Group ids in deterministic activation order, `(default)` last.
    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.keys().cloned().collect();
        ids.sort_by(|a, b| (a == DEFAULT_GROUP).cmp(&(b == DEFAULT_GROUP)).then(a.cmp(b)));
        ids
    }

    /// Resolve a requested name to a model id via the alias table.
    pub fn resolve<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.models.contains_key(name) {
            return Some(name);
        }
        self.aliases.get(name).map(String::as_str)
    }

    /// Expand macros, tokenise commands, build the alias table, assign
    /// groups, and check every config invariant. Fatal errors are returned;
    /// recoverable misconfigurations are clamped with a warning.
    pub fn finalize(&mut self) -> Result<()> {
        if self.models.is_empty() {
            bail!("No models configured");
        }

        if self.health_check_timeout < 15 {
            tracing::warn!(
                configured = self.health_check_timeout,
                "healthCheckTimeout below the 15s minimum, raising to 15"
            );
            self.health_check_timeout = 15;
        }
        if self.start_port == 0 {
            bail!("startPort must be >= 1");
        }

        for name in self.macros.keys() {
            if !valid_macro_name(name) {
                bail!("Invalid macro name: {:?}", name);
            }
            if name == "PORT" || name == "MODEL_ID" || name == "PID" {
                bail!("Macro name {:?} is reserved", name);
            }
        }

        self.expand_models()?;
        self.build_aliases()?;
        self.assign_groups()?;

        for id in &self.hooks.on_startup.preload {
            if self.resolve(id).is_none() {
                bail!("hooks.on_startup.preload names unknown model {:?}", id);
            }
        }

        Ok(())
    }

    /// Substitute macros in every model and tokenise `cmd`. `${PORT}` is
    /// assigned monotonically from `startPort`, one port per model that
    /// references it; model ids are processed in sorted order so the
    /// assignment is stable across loads.
    fn expand_models(&mut self) -> Result<()> {
        let mut next_port = self.start_port;
        let mut seen_upstreams: HashMap<String, String> = HashMap::new();

        let mut ids: Vec<String> = self.models.keys().cloned().collect();
        ids.sort();

        for id in ids {
            let model = self.models.get_mut(&id).expect("id from keys");

            let mut macros = self.macros.clone();
            macros.insert("MODEL_ID".to_string(), id.clone());

            let cmd_raw = match &model.cmd {
                CommandLine::Line(s) => s.clone(),
                CommandLine::Argv(v) => v.join(" "),
            };
            let proxy_raw = model
                .proxy
                .clone()
                .unwrap_or_else(|| "http://localhost:${PORT}".to_string());

            let mut referencing = vec![
                cmd_raw.clone(),
                proxy_raw.clone(),
                model.cmd_stop.clone().unwrap_or_default(),
            ];
            referencing.extend(model.env.iter().cloned());
            let references_port = referencing
                .iter()
                .any(|s| find_macros(s).iter().any(|m| m == "PORT"));

            if references_port {
                if find_macros(&proxy_raw).iter().any(|m| m == "PORT")
                    && !find_macros(&cmd_raw).iter().any(|m| m == "PORT")
                {
                    bail!(
                        "Model {:?}: proxy uses ${{PORT}} but cmd does not; \
                         the backend would never listen on the assigned port",
                        id
                    );
                }
                macros.insert("PORT".to_string(), next_port.to_string());
                next_port = next_port
                    .checked_add(1)
                    .context("Ran out of ports for ${PORT} assignment")?;
            }

            let tokens = match &model.cmd {
                CommandLine::Argv(v) => v
                    .iter()
                    .map(|t| substitute(t, &macros, &id))
                    .collect::<Result<Vec<_>>>()?,
                CommandLine::Line(s) => tokenise(&substitute(s, &macros, &id)?)
                    .with_context(|| format!("Model {:?}: unbalanced quotes in cmd", id))?,
            };
            if tokens.is_empty() {
                bail!("Model {:?}: cmd is empty", id);
            }
            model.cmd = CommandLine::Argv(tokens);

            let proxy = substitute(&proxy_raw, &macros, &id)?;
            if let Some(owner) = seen_upstreams.insert(proxy.clone(), id.clone()) {
                bail!(
                    "Models {:?} and {:?} resolve to the same upstream {}",
                    owner,
                    id,
                    proxy
                );
            }
            model.proxy = Some(proxy);

            if let Some(stop) = model.cmd_stop.clone() {
                // ${PID} survives until stop time.
                let mut stop_macros = macros.clone();
                stop_macros.insert("PID".to_string(), "${PID}".to_string());
                model.cmd_stop = Some(substitute(&stop, &stop_macros, &id)?);
            }
            let check = substitute(&model.check_endpoint, &macros, &id)?;
            model.check_endpoint = check;
            model.env = model
                .env
                .iter()
                .map(|e| substitute(e, &macros, &id))
                .collect::<Result<Vec<_>>>()?;
            for entry in &model.env {
                if !entry.contains('=') {
                    bail!("Model {:?}: env entry {:?} is not K=V", id, entry);
                }
            }
        }
        Ok(())
    }

    fn build_aliases(&mut self) -> Result<()> {
        let mut aliases: HashMap<String, String> = HashMap::new();
        let mut ids: Vec<&String> = self.models.keys().collect();
        ids.sort();
        for id in ids {
            for alias in &self.models[id].aliases {
                if self.models.contains_key(alias) {
                    bail!("Alias {:?} collides with a model id", alias);
                }
                if let Some(other) = aliases.insert(alias.clone(), id.clone()) {
                    bail!("Alias {:?} is claimed by both {:?} and {:?}", alias, other, id);
                }
            }
        }
        self.aliases = aliases;
        Ok(())
    }

    fn assign_groups(&mut self) -> Result<()> {
        let mut grouped: HashSet<String> = HashSet::new();
        for (gid, group) in &self.groups {
            if gid == DEFAULT_GROUP {
                bail!("Group id {:?} is reserved", DEFAULT_GROUP);
            }
            if group.members.is_empty() {
                bail!("Group {:?} has no members", gid);
            }
            for member in &group.members {
                if !self.models.contains_key(member) {
                    bail!("Group {:?} references unknown model {:?}", gid, member);
                }
                if !grouped.insert(member.clone()) {
                    bail!("Model {:?} appears in more than one group", member);
                }
            }
        }

        let mut ungrouped: Vec<String> = self
            .models
            .keys()
            .filter(|id| !grouped.contains(*id))
            .cloned()
            .collect();
        ungrouped.sort();
        if !ungrouped.is_empty() {
            self.groups.insert(
                DEFAULT_GROUP.to_string(),
                GroupConfig {
                    members: ungrouped,
                    swap: true,
                    exclusive: true,
                    persistent: false,
                },
            );
        }
        Ok(())
    }
}

fn valid_macro_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Every `${NAME}` occurrence in `s` with a well-formed name.
fn find_macros(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if valid_macro_name(name) {
                    out.push(name.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Substitute `${NAME}` occurrences from `macros`. Any macro left over
/// afterwards is fatal.
fn substitute(s: &str, macros: &HashMap<String, String>, model_id: &str) -> Result<String> {
    let mut out = s.to_string();
    for name in find_macros(s) {
        if let Some(value) = macros.get(&name) {
            out = out.replace(&format!("${{{name}}}"), value);
        }
    }
    let leftover: Vec<String> = find_macros(&out)
        .into_iter()
        .filter(|m| m != "PID")
        .collect();
    if !leftover.is_empty() {
        bail!("Model {:?}: unresolved macros {:?} in {:?}", model_id, leftover, s);
    }
    Ok(out)
}

/// Split a command string into argv, honouring double and single quotes and
/// backslash escapes outside single quotes. Returns None on unbalanced
/// quotes.
fn tokenise(s: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some(_) => match c {
                '"' => quote = None,
                '\\' => current.push(chars.next()?),
                _ => current.push(c),
            },
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    current.push(chars.next()?);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        return None;
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}
