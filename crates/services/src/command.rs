//! Subcommand tables with per-command documentation and grant policy.

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use {
    mememo_auth::{CallContext, Policy},
    mememo_common::{Error, Result},
    tracing::debug,
};

/// Subcommand every dispatcher answers unless a handler claims the name.
pub const HELP: &str = "help";
const HELP_USAGE: &str = "help [command]";

/// Usage line plus long description, attached at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDoc {
    pub usage: String,
    pub description: String,
}

impl CommandDoc {
    pub fn new(usage: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            usage: usage.into(),
            description: description.into(),
        }
    }
}

/// Context passed to every subcommand handler.
pub struct CommandContext<S> {
    pub state: Arc<S>,
    pub call: CallContext,
    pub command: String,
    /// Arguments after the subcommand name.
    pub args: Vec<String>,
}

impl<S> CommandContext<S> {
    /// The `index`th argument, or a validation error naming `what`.
    pub fn arg(&self, index: usize, what: &str) -> Result<&str> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| Error::validation(format!("missing argument: {what}")))
    }
}

/// A boxed async subcommand handler.
pub type CommandFn<S> = Box<
    dyn Fn(CommandContext<S>) -> Pin<Box<dyn Future<Output = Result<String>> + Send>>
        + Send
        + Sync,
>;

struct Entry<S> {
    doc: CommandDoc,
    policy: Policy,
    handler: CommandFn<S>,
}

/// Name to handler table for one handler object of type `S`.
pub struct CommandDispatcher<S> {
    state: Arc<S>,
    commands: BTreeMap<String, Entry<S>>,
    fallback: Option<String>,
}

impl<S: Send + Sync + 'static> CommandDispatcher<S> {
    pub fn new(state: Arc<S>) -> Self {
        Self {
            state,
            commands: BTreeMap::new(),
            fallback: None,
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        doc: CommandDoc,
        policy: Policy,
        handler: CommandFn<S>,
    ) {
        self.commands.insert(name.into(), Entry {
            doc,
            policy,
            handler,
        });
    }

    /// Subcommand used when the first argument names no registered command.
    pub fn set_fallback(&mut self, name: impl Into<String>) {
        self.fallback = Some(name.into());
    }

    fn builtin_help(&self) -> bool {
        !self.commands.contains_key(HELP)
    }

    /// Usage lines of every command sorted by name, or the full doc of one.
    pub fn help_text(&self, name: Option<&str>) -> Result<String> {
        match name {
            None => {
                let mut usages: Vec<(&str, &str)> = self
                    .commands
                    .iter()
                    .map(|(name, e)| (name.as_str(), e.doc.usage.as_str()))
                    .collect();
                if self.builtin_help() {
                    usages.push((HELP, HELP_USAGE));
                    usages.sort_unstable();
                }
                Ok(usages
                    .into_iter()
                    .map(|(_, usage)| usage)
                    .collect::<Vec<_>>()
                    .join("\n"))
            },
            Some(HELP) if self.builtin_help() => {
                Ok(format!("{HELP_USAGE}\nList commands, or show the full help of one."))
            },
            Some(name) => {
                let entry = self
                    .commands
                    .get(name)
                    .ok_or_else(|| Error::not_found("command", name))?;
                Ok(format!("{}\n{}", entry.doc.usage, entry.doc.description)
                    .trim_end()
                    .to_string())
            },
        }
    }

    /// Resolve the subcommand from `call.args`, check its policy, run it.
    pub async fn dispatch(&self, call: CallContext) -> Result<String> {
        if let Some((first, rest)) = call.args.split_first()
            && first == HELP
            && self.builtin_help()
        {
            return self.help_text(rest.first().map(String::as_str));
        }
        let (name, rest) = match call.args.split_first() {
            Some((first, rest)) if self.commands.contains_key(first) => {
                (first.clone(), rest.to_vec())
            },
            _ => {
                let fallback = self.fallback.clone().ok_or_else(|| {
                    Error::validation(match call.args.first() {
                        Some(first) => format!("unknown command: {first}"),
                        None => "missing command".to_string(),
                    })
                })?;
                (fallback, call.args.clone())
            },
        };
        let entry = self
            .commands
            .get(&name)
            .ok_or_else(|| Error::not_found("command", name.as_str()))?;

        entry.policy.check(&call)?;
        debug!(
            function = %call.function_name,
            command = %name,
            user = %call.username(),
            "dispatching command"
        );
        (entry.handler)(CommandContext {
            state: Arc::clone(&self.state),
            call,
            command: name,
            args: rest,
        })
        .await
    }
}
