//! View-model for generated fragments: the file tree, breadcrumbs, file
//! selection and the result pane that ties them to a project's messages.

pub mod breadcrumb;
pub mod file_explorer;
pub mod presenter;
pub mod tree;
