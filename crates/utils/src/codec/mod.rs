/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod dumb;

/// Encodes a value into its tagged on-disk payload.
pub trait Serialize {
    fn serialize(&self) -> trc::Result<Vec<u8>>;
}

/// Decodes a tagged on-disk payload. Implementations must verify the
/// leading tag byte and fail on a mismatch instead of reinterpreting.
pub trait Deserialize: Sized {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self>;
}
