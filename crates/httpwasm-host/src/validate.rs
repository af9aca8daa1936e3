//! Guest module validation for exports and imports.
//!
//! - Guests must export memory and the entrypoints their dispatch strategy
//!   calls, with the ABI signatures.
//! - Guests may only import known host functions (with matching
//!   signatures) and the POSIX subset.

use wasmtime::{ExternType, Module};

use crate::abi::{self, FuncSig, HANDLE_REQUEST_SIG, HANDLE_RESPONSE_SIG};
use crate::config::DispatchStrategy;
use crate::error::MiddlewareError;

/// What validation learned about the guest's imports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// The guest imports the POSIX subset and needs WASI linked.
    pub uses_wasi: bool,
}

/// Validate that the guest exports what `strategy` requires.
pub fn validate_exports(module: &Module, strategy: DispatchStrategy) -> Result<(), MiddlewareError> {
    match module.get_export(abi::MEMORY_EXPORT) {
        Some(ExternType::Memory(_)) => {}
        Some(other) => {
            return Err(MiddlewareError::InvalidExportSignature {
                name: abi::MEMORY_EXPORT.into(),
                expected: "memory".into(),
                actual: format!("{other:?}"),
            })
        }
        None => return Err(MiddlewareError::MissingExport(abi::MEMORY_EXPORT.into())),
    }

    validate_func_export(module, &HANDLE_REQUEST_SIG)?;
    if strategy == DispatchStrategy::Pooled {
        validate_func_export(module, &HANDLE_RESPONSE_SIG)?;
    }

    Ok(())
}

/// Validate the guest's imports against the host module.
pub fn validate_imports(
    module: &Module,
    strategy: DispatchStrategy,
) -> Result<ImportSummary, MiddlewareError> {
    let mut summary = ImportSummary::default();

    for import in module.imports() {
        match import.module() {
            abi::HOST_MODULE => {
                let sig = abi::host_function(import.name())
                    .filter(|sig| !sig.one_shot_only || strategy == DispatchStrategy::OneShot)
                    .ok_or_else(|| unknown_import(import.module(), import.name()))?;
                match import.ty() {
                    ExternType::Func(ty) if sig.matches(&ty) => {}
                    other => {
                        return Err(MiddlewareError::InvalidExportSignature {
                            name: format!("{}::{}", abi::HOST_MODULE, sig.name),
                            expected: sig.to_string(),
                            actual: format!("{other:?}"),
                        })
                    }
                }
            }
            abi::WASI_MODULE => summary.uses_wasi = true,
            other => return Err(unknown_import(other, import.name())),
        }
    }

    Ok(summary)
}

fn validate_func_export(module: &Module, sig: &FuncSig) -> Result<(), MiddlewareError> {
    match module.get_export(sig.name) {
        Some(ExternType::Func(ty)) if sig.matches(&ty) => Ok(()),
        Some(other) => Err(MiddlewareError::InvalidExportSignature {
            name: sig.name.into(),
            expected: sig.to_string(),
            actual: format!("{other:?}"),
        }),
        None => Err(MiddlewareError::MissingExport(sig.name.into())),
    }
}

fn unknown_import(module: &str, name: &str) -> MiddlewareError {
    MiddlewareError::UnknownImport {
        module: module.into(),
        name: name.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GuestEngine;

    fn compile(wat: &str) -> Module {
        GuestEngine::new().unwrap().compile(wat.as_bytes()).unwrap()
    }

    const POOLED_GUEST: &str = r#"
        (module
          (import "http-handler" "get_uri" (func (param i32 i32) (result i32)))
          (memory (export "memory") 1)
          (func (export "handle_request") (result i64) (i64.const 0))
          (func (export "handle_response") (param i32 i32)))
    "#;

    #[test]
    fn accepts_pooled_guest() {
        let module = compile(POOLED_GUEST);
        assert!(validate_exports(&module, DispatchStrategy::Pooled).is_ok());
        assert_eq!(
            validate_imports(&module, DispatchStrategy::Pooled).unwrap(),
            ImportSummary { uses_wasi: false }
        );
    }

    #[test]
    fn missing_memory() {
        let module = compile(
            r#"(module
                 (func (export "handle_request") (result i64) (i64.const 0))
                 (func (export "handle_response") (param i32 i32)))"#,
        );
        match validate_exports(&module, DispatchStrategy::Pooled) {
            Err(MiddlewareError::MissingExport(name)) => assert_eq!(name, "memory"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_handle_request() {
        let module = compile(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "handle_response") (param i32 i32)))"#,
        );
        match validate_exports(&module, DispatchStrategy::Pooled) {
            Err(MiddlewareError::MissingExport(name)) => assert_eq!(name, "handle_request"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn handle_response_only_required_when_pooled() {
        let module = compile(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "handle_request") (result i64) (i64.const 0)))"#,
        );
        match validate_exports(&module, DispatchStrategy::Pooled) {
            Err(MiddlewareError::MissingExport(name)) => assert_eq!(name, "handle_response"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(validate_exports(&module, DispatchStrategy::OneShot).is_ok());
    }

    #[test]
    fn wrong_entrypoint_signature() {
        let module = compile(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "handle_request") (result i32) (i32.const 0))
                 (func (export "handle_response") (param i32 i32)))"#,
        );
        assert!(matches!(
            validate_exports(&module, DispatchStrategy::Pooled),
            Err(MiddlewareError::InvalidExportSignature { .. })
        ));
    }

    #[test]
    fn rejects_unknown_host_function() {
        let module = compile(
            r#"(module
                 (import "http-handler" "get_secret" (func (param i32 i32) (result i32)))
                 (memory (export "memory") 1))"#,
        );
        assert!(matches!(
            validate_imports(&module, DispatchStrategy::Pooled),
            Err(MiddlewareError::UnknownImport { .. })
        ));
    }

    #[test]
    fn rejects_mismatched_import_signature() {
        let module = compile(
            r#"(module
                 (import "http-handler" "get_uri" (func (param i32) (result i32)))
                 (memory (export "memory") 1))"#,
        );
        assert!(matches!(
            validate_imports(&module, DispatchStrategy::Pooled),
            Err(MiddlewareError::InvalidExportSignature { .. })
        ));
    }

    #[test]
    fn await_response_requires_one_shot() {
        let module = compile(
            r#"(module
                 (import "http-handler" "await_response" (func (param i64) (result i32)))
                 (memory (export "memory") 1))"#,
        );
        assert!(validate_imports(&module, DispatchStrategy::Pooled).is_err());
        assert!(validate_imports(&module, DispatchStrategy::OneShot).is_ok());
    }

    #[test]
    fn detects_wasi_imports() {
        let module = compile(
            r#"(module
                 (import "wasi_snapshot_preview1" "fd_write"
                   (func (param i32 i32 i32 i32) (result i32)))
                 (memory (export "memory") 1))"#,
        );
        assert!(validate_imports(&module, DispatchStrategy::Pooled).unwrap().uses_wasi);
    }

    #[test]
    fn rejects_foreign_modules() {
        let module = compile(
            r#"(module
                 (import "env" "abort" (func))
                 (memory (export "memory") 1))"#,
        );
        match validate_imports(&module, DispatchStrategy::Pooled) {
            Err(MiddlewareError::UnknownImport { module, name }) => {
                assert_eq!(module, "env");
                assert_eq!(name, "abort");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
