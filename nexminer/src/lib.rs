// Copyright (C) 2020  Nexminer contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Framework contract between a mining frontend (work-queue producer, nonce
//! validator, pool protocol) and hashing hardware backends. The frontend side
//! of this contract lives in the embedding application; backends only depend
//! on the types and traits exported here.

pub mod hal;
pub mod logging;
pub mod shutdown;
pub mod stats;
pub mod target;
pub mod work;
