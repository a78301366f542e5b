/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! [Vectors of values of bounded bit width](`mod@bit_field_vec`).

pub mod bit_field_vec;
pub use bit_field_vec::*;
