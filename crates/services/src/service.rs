use {async_trait::async_trait, mememo_auth::CallContext, mememo_common::Result};

/// Anything the [`crate::ServiceManager`] can route a call to.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this service claims the function `name`.
    fn handles_function(&self, name: &str) -> bool;

    /// Whether this service claims a raw free-text message.
    fn handles_message(&self, _text: &str) -> bool {
        false
    }

    /// Usage line followed by an optional description block.
    fn help_text(&self) -> String;

    /// Handle one call. The context carries the function name and arguments.
    async fn call(&self, ctx: &CallContext) -> Result<String>;
}
