// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use backtrace::Backtrace;
use std::fmt::Debug;
use thiserror::Error;

/// Default error type for the crate.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("No code emitters for operator {op} in {name}\n{trace}")]
    UnsupportedOp {
        name: String,
        op: String,
        trace: String,
    },
    #[error("Unexpected empty input for {name}\n{trace}")]
    Empty { name: String, trace: String },
    #[error("Incompatible lengths for {name}: {lengths}\n{trace}")]
    Lengths {
        name: String,
        lengths: String,
        trace: String,
    },
    #[error("Index tables passed to {name} do not match the compiled kernel: {details}\n{trace}")]
    SignatureMismatch {
        name: String,
        details: String,
        trace: String,
    },
    #[error("Registry operation {name} failed: {details}\n{trace}")]
    RegistryLookup {
        name: String,
        details: String,
        trace: String,
    },
    #[error("Normal-equations matrix is singular in {name}\n{trace}")]
    Singular { name: String, trace: String },
}

/// Default result type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Computes the name of the current function.
// https://stackoverflow.com/questions/38088067/equivalent-of-func-or-function-in-rust
#[macro_export]
macro_rules! func_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        &name[..name.len() - 3]
    }};
}

impl Error {
    fn backtrace() -> String {
        if std::env::var("RUST_BACKTRACE").is_ok() {
            format!("{:?}", Backtrace::new())
        } else {
            String::new()
        }
    }

    /// Report an operator without compiled-code support.
    pub fn unsupported_op<O>(name: &str, op: O) -> Self
    where
        O: Debug,
    {
        Error::UnsupportedOp {
            name: name.to_string(),
            op: format!("{:?}", op),
            trace: Self::backtrace(),
        }
    }

    /// Report an empty input.
    pub fn empty(name: &str) -> Self {
        Error::Empty {
            name: name.to_string(),
            trace: Self::backtrace(),
        }
    }

    /// Report incompatible lengths.
    pub fn lengths<L>(name: &str, lengths: L) -> Self
    where
        L: Debug,
    {
        Error::Lengths {
            name: name.to_string(),
            lengths: format!("{:?}", lengths),
            trace: Self::backtrace(),
        }
    }

    /// Report index tables that do not fit a compiled kernel.
    pub fn signature_mismatch<D>(name: &str, details: D) -> Self
    where
        D: Debug,
    {
        Error::SignatureMismatch {
            name: name.to_string(),
            details: format!("{:?}", details),
            trace: Self::backtrace(),
        }
    }

    /// Report a failed registry registration or lookup.
    pub fn registry_lookup(name: &str, details: &str) -> Self {
        Error::RegistryLookup {
            name: name.to_string(),
            details: details.to_string(),
            trace: Self::backtrace(),
        }
    }

    /// Report a matrix that could not be factored.
    pub fn singular(name: &str) -> Self {
        Error::Singular {
            name: name.to_string(),
            trace: Self::backtrace(),
        }
    }
}

/// Check that all the given lengths are equal.
pub fn check_equal_lengths(name: &str, lengths: &[usize]) -> Result<usize> {
    let mut it = lengths.iter();
    if let Some(first) = it.next() {
        if it.all(|x| x == first) {
            Ok(*first)
        } else {
            Err(Error::lengths(name, lengths))
        }
    } else {
        Err(Error::empty(name))
    }
}
