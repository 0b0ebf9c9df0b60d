//! A small, dynamically typed scripting language with a cooperative,
//! garbage collected virtual machine.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use quill_lang::*;
