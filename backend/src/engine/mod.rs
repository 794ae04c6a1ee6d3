// Declarative execution engine
//
// Template substitution, condition evaluation, trigger filtering and the
// action executor. No language model runs here: automations execute exactly
// the tools their authors declared.

pub mod conditions;
pub mod executor;
pub mod filters;
pub mod templates;
pub mod validate;

pub use conditions::evaluate_condition;
pub use executor::{record_execution, ExecutionInput, Executor, DEFAULT_ACTION_TIMEOUT};
pub use filters::evaluate_filter;
pub use templates::{get_nested_value, resolve_parameters, resolve_template, BuiltinVars};
pub use validate::validate_actions;
