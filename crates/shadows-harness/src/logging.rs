use hiro_system_kit::Logger;

/// Logging handle threaded through the harness components.
///
/// Components never install a global logger; the binary owns it and hands a
/// clone down. An empty context turns every log call into a no-op.
#[derive(Clone, Debug, Default)]
pub struct LogCtx {
    pub logger: Option<Logger>,
}

impl LogCtx {
    pub fn empty() -> LogCtx {
        LogCtx { logger: None }
    }

    pub fn new(logger: Logger) -> LogCtx {
        LogCtx { logger: Some(logger) }
    }

    pub fn try_log<F>(&self, closure: F)
    where
        F: FnOnce(&Logger),
    {
        if let Some(ref logger) = self.logger {
            closure(logger)
        }
    }

    /// Only for callers that installed a logger themselves, like the CLI.
    pub fn expect_logger(&self) -> &Logger {
        self.logger.as_ref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_context_skips_closure() {
        let ctx = LogCtx::empty();
        let mut called = false;
        ctx.try_log(|_| called = true);
        assert!(!called);
        assert!(ctx.logger.is_none());
    }
}
