//! Parameter preview built on the plugin client.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ParameterPreview`] | Mirrors the current model's parameters |
//! | [`ParameterTable`] | Ordered parameters with their last values |
//! | [`TokenStore`] | Token persistence across runs |

// ============================================================================
// Submodules
// ============================================================================

/// Preview controller.
pub mod controller;

/// Token persistence.
pub mod store;

/// Parameter tables.
pub mod table;

// ============================================================================
// Re-exports
// ============================================================================

pub use controller::{ParameterPreview, PreviewSnapshot};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use table::{ParameterRow, ParameterTable};
