//! The `EngineAdapter` trait -- the interface for document parsing engines.
//!
//! Each concrete parsing backend (a specific OCR/layout engine, a thin
//! wrapper over an external CLI, etc.) implements this trait. The trait
//! is intentionally object-safe so it can be stored as
//! `Box<dyn EngineAdapter>` in the [`super::EngineRegistry`].

use std::path::Path;

use async_trait::async_trait;

use super::types::{EngineError, ParseOutcome};

/// Cooperative cancellation signal passed into a running parse.
///
/// Adapters that can check it between steps should bail out early with
/// [`EngineError::Transient`] when it reports cancelled; adapters that
/// can't (a single opaque subprocess call) are allowed to run to
/// completion, with the caller discarding the result.
pub trait CancelSignal: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Adapter interface for document preprocessing backends.
///
/// Implementors wrap a specific parsing engine and translate its
/// invocation into a uniform (input, options, output directory) -> result
/// contract.
///
/// # Object Safety
///
/// This trait is object-safe: every method either returns a concrete type
/// or a boxed trait object. This means you can store `Box<dyn
/// EngineAdapter>` in collections such as [`super::EngineRegistry`].
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Human-readable backend name (e.g. "default", "ocr-heavy").
    fn name(&self) -> &str;

    /// Parse `input` into `output_dir`, honoring `options` and bailing
    /// out early (with a transient error) if `cancel` reports the task
    /// has been cancelled.
    async fn parse(
        &self,
        input: &Path,
        options: &serde_json::Value,
        output_dir: &Path,
        cancel: &dyn CancelSignal,
    ) -> Result<ParseOutcome, EngineError>;
}

// Compile-time assertion: EngineAdapter must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn EngineAdapter) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverCancelled;
    impl CancelSignal for NeverCancelled {
        fn is_cancelled(&self) -> bool {
            false
        }
    }

    /// A trivial adapter that does nothing, used only to prove the trait
    /// can be implemented and used as `dyn EngineAdapter`.
    struct NoopEngine;

    #[async_trait]
    impl EngineAdapter for NoopEngine {
        fn name(&self) -> &str {
            "noop"
        }

        async fn parse(
            &self,
            _input: &Path,
            _options: &serde_json::Value,
            _output_dir: &Path,
            _cancel: &dyn CancelSignal,
        ) -> Result<ParseOutcome, EngineError> {
            Ok(ParseOutcome {
                markdown_rel_path: "output.md".into(),
                json_rel_path: None,
            })
        }
    }

    #[test]
    fn engine_adapter_is_object_safe() {
        let engine: Box<dyn EngineAdapter> = Box::new(NoopEngine);
        assert_eq!(engine.name(), "noop");
    }

    #[tokio::test]
    async fn noop_engine_parses_successfully() {
        let engine: Box<dyn EngineAdapter> = Box::new(NoopEngine);
        let outcome = engine
            .parse(
                Path::new("/tmp/in.pdf"),
                &serde_json::json!({}),
                Path::new("/tmp/out"),
                &NeverCancelled,
            )
            .await
            .unwrap();
        assert_eq!(outcome.markdown_rel_path, Path::new("output.md"));
        assert!(outcome.json_rel_path.is_none());
    }
}
