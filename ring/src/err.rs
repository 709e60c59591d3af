// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::Params;

#[derive(thiserror::Error, Debug)]
pub enum InvalidArgument {
    #[error("ring size must be a nonzero power of two ({size} given)", size = .0.size)]
    SizeNotPowerOfTwo(Params),
    #[error("only alphanumeric ring names are supported (may contain -, _, and .)")]
    IllegalCharacters(Params),
    #[error("ring name too long (max is {} ASCII characters)", Params::MAX_NAME_LENGTH)]
    NameTooLong(Params),
    #[error("watermarks must satisfy low < high <= size")]
    BadWatermarks(Params),
}
