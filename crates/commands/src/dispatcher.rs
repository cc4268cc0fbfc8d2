use std::{
    collections::{BTreeMap, HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    futures::FutureExt,
    parley_common::{Error, InboundEvent, Outbound, Result, now_ms},
    parley_config::CommandsConfig,
    parley_store::{CommandUsage, UsageStore},
    tracing::{debug, error, info, warn},
};

use crate::command::{Command, CommandContext, CommandHandler, CommandSummary};

const APOLOGY: &str = "Sorry, something went wrong while running that command.";

/// Expired cooldown records are swept once per this many invocations.
const PRUNE_EVERY_INVOCATIONS: u64 = 256;

struct Registered {
    summary: CommandSummary,
    handler: Arc<dyn CommandHandler>,
}

#[derive(Default)]
struct Registry {
    commands: HashMap<String, Arc<Registered>>,
    /// alias -> canonical name
    aliases: HashMap<String, String>,
}

impl Registry {
    fn resolve(&self, token: &str) -> Option<Arc<Registered>> {
        self.commands.get(token).cloned().or_else(|| {
            self.aliases
                .get(token)
                .and_then(|name| self.commands.get(name).cloned())
        })
    }
}

/// Split `!cmd a  b` into `("cmd", ["a", "b"])`.
///
/// Returns `None` when `body` does not start with `prefix` or no command
/// token follows it directly.
pub fn parse_invocation(prefix: char, body: &str) -> Option<(String, Vec<String>)> {
    let rest = body.strip_prefix(prefix)?;
    if rest.starts_with(char::is_whitespace) {
        return None;
    }
    let mut tokens = rest.split_whitespace();
    let candidate = tokens.next()?.to_lowercase();
    Some((candidate, tokens.map(str::to_string).collect()))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Command registry plus the dispatch path that runs handlers.
pub struct Dispatcher {
    prefix: char,
    respond_to_self: bool,
    disabled: HashSet<String>,
    registry: RwLock<Registry>,
    /// (command, conversation) -> last invocation, epoch ms
    cooldowns: DashMap<(String, String), u64>,
    invocations: AtomicU64,
    usage: DashMap<String, CommandUsage>,
    usage_store: Option<Arc<dyn UsageStore>>,
    outbound: Arc<dyn Outbound>,
}

impl Dispatcher {
    pub fn new(config: &CommandsConfig, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            prefix: config.prefix,
            respond_to_self: config.respond_to_self,
            disabled: config.disabled.iter().map(|n| n.to_lowercase()).collect(),
            registry: RwLock::new(Registry::default()),
            cooldowns: DashMap::new(),
            invocations: AtomicU64::new(0),
            usage: DashMap::new(),
            usage_store: None,
            outbound,
        }
    }

    #[must_use]
    pub fn with_usage_store(mut self, store: Arc<dyn UsageStore>) -> Self {
        self.usage_store = Some(store);
        self
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    pub fn register(&self, command: Command) -> Result<()> {
        let name = command.name.trim().to_lowercase();
        if name.is_empty() {
            return Err(Error::validation("command name must not be empty"));
        }
        if command.name.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "command name {:?} must not contain whitespace",
                command.name
            )));
        }
        let Some(handler) = command.handler else {
            return Err(Error::validation(format!("command {name} has no handler")));
        };

        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if reg.commands.contains_key(&name) {
            return Err(Error::validation(format!("command {name} is already registered")));
        }

        let mut claimed = Vec::new();
        for alias in command.aliases {
            let alias = alias.trim().to_lowercase();
            if alias.is_empty() || alias == name || claimed.contains(&alias) {
                continue;
            }
            if let Some(owner) = reg.aliases.get(&alias) {
                warn!(command = %name, alias = %alias, owner = %owner, "alias already claimed, skipping");
                continue;
            }
            if reg.commands.contains_key(&alias) {
                warn!(command = %name, alias = %alias, "alias shadows a command name, skipping");
                continue;
            }
            reg.aliases.insert(alias.clone(), name.clone());
            claimed.push(alias);
        }

        info!(command = %name, aliases = ?claimed, cooldown_ms = command.cooldown_ms, "command registered");
        let summary = CommandSummary {
            name: name.clone(),
            aliases: claimed,
            category: command.category,
            description: command.description,
            usage: command.usage,
            cooldown_ms: command.cooldown_ms,
        };
        reg.commands
            .insert(name, Arc::new(Registered { summary, handler }));
        Ok(())
    }

    /// Remove a command with its aliases and cooldown state.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if reg.commands.remove(&name).is_none() {
            return Err(Error::not_found("command", name));
        }
        reg.aliases.retain(|_, owner| *owner != name);
        self.cooldowns.retain(|(cmd, _), _| *cmd != name);
        info!(command = %name, "command unregistered");
        Ok(())
    }

    /// Look up a command by name or alias, case-insensitively.
    pub fn resolve(&self, token: &str) -> Option<CommandSummary> {
        let token = token.trim().to_lowercase();
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(&token)
            .map(|r| r.summary.clone())
    }

    pub fn len(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .commands
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enabled commands grouped by category, each group sorted by name.
    pub fn list(&self) -> BTreeMap<String, Vec<CommandSummary>> {
        let reg = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let mut grouped: BTreeMap<String, Vec<CommandSummary>> = BTreeMap::new();
        for cmd in reg.commands.values() {
            if self.disabled.contains(&cmd.summary.name) {
                continue;
            }
            grouped
                .entry(cmd.summary.category.clone())
                .or_default()
                .push(cmd.summary.clone());
        }
        for group in grouped.values_mut() {
            group.sort_by(|a, b| a.name.cmp(&b.name));
        }
        grouped
    }

    /// In-memory invocation counters, most used first.
    pub fn usage(&self) -> Vec<CommandUsage> {
        let mut all: Vec<_> = self.usage.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.command.cmp(&b.command)));
        all
    }

    /// Total successful invocations since startup.
    pub fn executed(&self) -> u64 {
        self.usage.iter().map(|e| e.count).sum()
    }

    pub async fn dispatch(&self, event: Arc<InboundEvent>) -> bool {
        self.dispatch_at(event, now_ms()).await
    }

    /// Dispatch with an explicit clock. Returns `true` only when a handler
    /// ran and succeeded.
    pub async fn dispatch_at(&self, event: Arc<InboundEvent>, now_ms: u64) -> bool {
        if event.from_me && !self.respond_to_self {
            return false;
        }
        let Some((candidate, args)) = parse_invocation(self.prefix, &event.body) else {
            return false;
        };
        self.prune_if_needed(now_ms);

        let resolved = self
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(&candidate);
        let Some(command) = resolved else {
            debug!(command = %candidate, conversation_id = %event.conversation_id, "unknown command");
            return false;
        };
        let name = command.summary.name.clone();
        if self.disabled.contains(&name) {
            debug!(command = %name, "command disabled");
            return false;
        }

        let cooldown = command.summary.cooldown_ms;
        let key = (name.clone(), event.conversation_id.clone());
        let previous = if cooldown > 0 {
            match self.reserve_cooldown(&key, cooldown, now_ms) {
                Some(prev) => prev,
                None => {
                    debug!(command = %name, conversation_id = %event.conversation_id, "command on cooldown");
                    return false;
                },
            }
        } else {
            None
        };

        let ctx = CommandContext {
            event: Arc::clone(&event),
            command: name.clone(),
            invoked_as: candidate,
            args,
            outbound: Arc::clone(&self.outbound),
        };

        let outcome = AssertUnwindSafe(command.handler.run(ctx)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(format!("panic: {}", panic_message(panic.as_ref()))),
        };
        if let Some(failure) = failure {
            error!(
                command = %name,
                conversation_id = %event.conversation_id,
                sender_id = %event.sender_id,
                error = %failure,
                "command failed"
            );
            if cooldown > 0 {
                self.release_cooldown(key, now_ms, previous);
            }
            if let Err(e) = self
                .outbound
                .send_text(&event.conversation_id, APOLOGY)
                .await
            {
                warn!(conversation_id = %event.conversation_id, error = %e, "failed to send apology");
            }
            return false;
        }

        self.record_use(&name, now_ms).await;
        info!(command = %name, conversation_id = %event.conversation_id, "command executed");
        true
    }

    /// Stamp the cooldown slot if it is free.
    ///
    /// `None` means the slot is still cooling down. `Some(prev)` carries the
    /// stamp that was replaced so a failed run can restore it.
    fn reserve_cooldown(
        &self,
        key: &(String, String),
        cooldown_ms: u64,
        now_ms: u64,
    ) -> Option<Option<u64>> {
        match self.cooldowns.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let last = *slot.get();
                if now_ms < last.saturating_add(cooldown_ms) {
                    return None;
                }
                slot.insert(now_ms);
                Some(Some(last))
            },
            Entry::Vacant(slot) => {
                slot.insert(now_ms);
                Some(None)
            },
        }
    }

    /// Undo [`Self::reserve_cooldown`] unless another dispatch re-stamped
    /// the slot in the meantime.
    fn release_cooldown(&self, key: (String, String), stamped: u64, previous: Option<u64>) {
        if let Entry::Occupied(mut slot) = self.cooldowns.entry(key)
            && *slot.get() == stamped
        {
            match previous {
                Some(prev) => {
                    slot.insert(prev);
                },
                None => {
                    slot.remove();
                },
            }
        }
    }

    async fn record_use(&self, name: &str, now_ms: u64) {
        {
            let mut entry = self
                .usage
                .entry(name.to_string())
                .or_insert_with(|| CommandUsage {
                    command: name.to_string(),
                    count: 0,
                    last_used_at_ms: now_ms,
                });
            entry.count += 1;
            entry.last_used_at_ms = now_ms;
        }
        if let Some(store) = &self.usage_store
            && let Err(e) = store.record_use(name, now_ms).await
        {
            warn!(command = %name, error = %e, "failed to persist command usage");
        }
    }

    /// Number of live cooldown records.
    pub fn cooldown_records(&self) -> usize {
        self.cooldowns.len()
    }

    fn prune_if_needed(&self, now_ms: u64) {
        let seen = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        if seen.is_multiple_of(PRUNE_EVERY_INVOCATIONS) {
            self.prune_cooldowns(now_ms);
        }
    }

    /// Drop cooldown records that can no longer block anything.
    pub fn prune_cooldowns(&self, now_ms: u64) -> usize {
        let cooldowns: HashMap<String, u64> = self
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .commands
            .iter()
            .map(|(name, cmd)| (name.clone(), cmd.summary.cooldown_ms))
            .collect();
        let before = self.cooldowns.len();
        self.cooldowns.retain(|(name, _), last| {
            cooldowns
                .get(name)
                .is_some_and(|c| now_ms < last.saturating_add(*c))
        });
        let pruned = before - self.cooldowns.len();
        if pruned > 0 {
            debug!(pruned, "cooldown records pruned");
        }
        pruned
    }
}
