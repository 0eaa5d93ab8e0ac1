//! Client-side NPM operations: saving packages from the public
//! registry and pushing a local tree to a remote depot.

pub mod pkglock;
pub mod push;
pub mod save;
pub mod sri;
