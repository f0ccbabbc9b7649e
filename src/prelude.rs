// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    error::{Errno::*, Error},
    layers::bio::{Sector, SECTOR_SIZE},
    os::{Arc, Box, String, ToString, Vec},
    return_errno, return_errno_with_msg,
    util::{align_up, sectors_for},
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

pub(crate) use log::{debug, error, warn};
