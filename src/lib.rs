// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Web framework, CDN and CMS fingerprinting.
//!
//! Targets are identified either actively, by sending shaped probes and
//! matching the responses against a rule store, or passively, by running a
//! TLS-intercepting forward proxy that fingerprints the traffic it relays.

pub mod ca;
pub mod classify;
pub mod config;
pub mod connection;
pub mod favicon;
pub mod fetch;
pub mod html;
pub mod matcher;
pub mod output;
pub mod probe;
pub mod proxy;
pub mod redirect;
pub mod rules;

#[cfg(test)]
pub(crate) mod test_helpers;
