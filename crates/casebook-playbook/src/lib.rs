//! Playbook graphs: structure, ordering, activation and templates.

pub mod activation;
pub mod dag;
pub mod expr;
pub mod template;

pub use activation::{active_tasks, evaluate_requirement, is_active, is_task_active, playbook_view};
pub use dag::{playbook_graph, Graph};
pub use expr::ExprEvaluator;
pub use template::{kebab_case, unique_playbook_id, PlaybookTemplate, TemplateTask};
