mod builder;
mod record;
mod resolver;
mod script;

pub use builder::{INPUTS_DIR, OUTPUTS_DIR, Workspace, WorkspaceBuilder, WorkspaceError};
pub use record::{JobSection, RECORD_FILE, RecordError, WorkspaceRecord};
pub use resolver::{ReferenceResolver, ResolveError, StandardResolver};
pub use script::{MaterializedScript, SCRIPT_FILE, ScriptError, ScriptMaterializer};
