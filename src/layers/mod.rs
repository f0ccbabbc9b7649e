// SPDX-License-Identifier: MPL-2.0

#[path = "0-bio/mod.rs"]
pub mod bio;
#[path = "3-disk/mod.rs"]
pub mod disk;
#[path = "2-map/mod.rs"]
pub mod map;
#[path = "1-meta/mod.rs"]
pub mod meta;
