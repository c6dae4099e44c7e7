//! Abstract interpretation over method bodies.

pub(crate) mod analyzer;
pub(crate) mod branch;
pub(crate) mod const_source;
pub(crate) mod frame;
pub(crate) mod int_value;
pub(crate) mod interpreter;
pub(crate) mod liveness;
pub(crate) mod worklist;
