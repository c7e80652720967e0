//! Module loader that refuses every import.
//!
//! Both modules of an invocation are handed to the runtime as code, so the
//! loader never has to fetch source. Its only job is to let the trusted entry
//! module reach the guest module and to reject everything else, including any
//! import issued by guest code itself.

use deno_core::{
    ModuleLoadOptions, ModuleLoadReferrer, ModuleLoadResponse, ModuleLoader, ModuleSpecifier,
    ResolutionKind,
};
use deno_error::JsErrorBox;

/// Specifier under which the compiled guest module is registered.
pub const GUEST_SPECIFIER: &str = "sandbox:///guest.js";

/// Specifier of the host-generated entry module.
pub const ENTRY_SPECIFIER: &str = "sandbox:///entry.js";

/// A [`ModuleLoader`] with no module graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClosedModuleLoader;

impl ClosedModuleLoader {
    fn reject(specifier: &str) -> JsErrorBox {
        tracing::debug!(specifier, "module import rejected");
        JsErrorBox::type_error(format!(
            "module imports are not available in the sandbox: '{specifier}'"
        ))
    }
}

impl ModuleLoader for ClosedModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, JsErrorBox> {
        if referrer == GUEST_SPECIFIER {
            return Err(Self::reject(specifier));
        }
        match specifier {
            GUEST_SPECIFIER | ENTRY_SPECIFIER => {
                ModuleSpecifier::parse(specifier).map_err(|e| JsErrorBox::generic(e.to_string()))
            }
            _ => Err(Self::reject(specifier)),
        }
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleLoadReferrer>,
        _options: ModuleLoadOptions,
    ) -> ModuleLoadResponse {
        ModuleLoadResponse::Sync(Err(Self::reject(module_specifier.as_str())))
    }
}
