/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod codec;

pub const U32_LEN: usize = std::mem::size_of::<u32>();
pub const U64_LEN: usize = std::mem::size_of::<u64>();
