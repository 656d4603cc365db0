// Copyright (C) Microsoft Corporation. All rights reserved.

//! Crypto engines of the simulated SeP.
//!
//! Every engine keeps its running state in the context blob so a context can
//! leave the cache and be reloaded from host memory at any block boundary.

pub mod aes;
pub mod ccm;
pub mod cmac;
pub mod hmac;
pub mod sha;
