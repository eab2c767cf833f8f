/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Email metadata: the stored per-message entity, the metadata store with
//! its dense side columns and thread assignment, and thread grouping of
//! search results.

pub mod metadata;
pub mod store;
pub mod threads;

pub use metadata::{Metadata, Pointer, PointerKind};
pub use store::MetadataStore;
pub use threads::{SortOrder, ThreadGroup};
