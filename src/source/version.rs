//! Kernel version of a source tree, read from its top-level Makefile.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::error::PipelineError;

/// `VERSION.PATCHLEVEL.SUBLEVEL` of a kernel tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub patchlevel: u32,
    pub sublevel: u32,
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.patchlevel, self.sublevel)
    }
}

/// Read the version of the kernel tree at `kernel`.
///
/// Only the first four lines of the top-level Makefile are read: the SPDX
/// header, then `VERSION`, `PATCHLEVEL` and `SUBLEVEL`.
pub fn kernel_version(kernel: &Path) -> Result<KernelVersion> {
    let makefile = kernel.join("Makefile");
    let file = File::open(&makefile).map_err(|_| {
        PipelineError::not_found("kernel Makefile", makefile.display().to_string())
    })?;

    let head = BufReader::new(file)
        .lines()
        .take(4)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("reading '{}'", makefile.display()))?;

    parse_makefile_version(&head)
        .with_context(|| format!("parsing kernel version from '{}'", makefile.display()))
}

/// Parse the version from the first four Makefile lines.
pub fn parse_makefile_version<S: AsRef<str>>(head: &[S]) -> Result<KernelVersion> {
    if head.len() < 4 {
        bail!(
            "expected at least 4 lines in the kernel Makefile, found {}",
            head.len()
        );
    }

    let mut fields = [0u32; 3];
    for (slot, line) in fields.iter_mut().zip(&head[1..4]) {
        let line = line.as_ref();
        let Some((key, value)) = line.split_once(" = ") else {
            bail!("malformed version line '{}': expected 'KEY = value'", line);
        };
        *slot = value.trim().parse().with_context(|| {
            format!("{} value '{}' is not an integer", key.trim(), value.trim())
        })?;
    }

    Ok(KernelVersion {
        major: fields[0],
        patchlevel: fields[1],
        sublevel: fields[2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use std::fs;

    #[test]
    fn parses_standard_header() {
        let head = [
            "# SPDX-License-Identifier: GPL-2.0",
            "VERSION = 5",
            "PATCHLEVEL = 10",
            "SUBLEVEL = 0",
        ];
        let version = parse_makefile_version(&head).unwrap();
        assert_eq!(version.to_string(), "5.10.0");
    }

    #[test]
    fn rejects_short_makefile() {
        let err = parse_makefile_version(&["# SPDX", "VERSION = 6"]).unwrap_err();
        assert!(err.to_string().contains("at least 4 lines"));
    }

    #[test]
    fn rejects_non_numeric_field() {
        let head = ["#", "VERSION = 6", "PATCHLEVEL = x", "SUBLEVEL = 1"];
        assert!(parse_makefile_version(&head).is_err());
    }

    #[test]
    fn rejects_line_without_separator() {
        let head = ["#", "VERSION=6", "PATCHLEVEL = 1", "SUBLEVEL = 1"];
        assert!(parse_makefile_version(&head).is_err());
    }

    #[test]
    fn reads_only_the_top_of_the_makefile() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(
            temp.path().join("Makefile"),
            "# SPDX-License-Identifier: GPL-2.0\nVERSION = 6\nPATCHLEVEL = 1\nSUBLEVEL = 42\nEXTRAVERSION = -rc1\nNAME = Curry Ramen\n",
        )
        .unwrap();

        let version = kernel_version(temp.path()).unwrap();
        assert_eq!(
            version,
            KernelVersion {
                major: 6,
                patchlevel: 1,
                sublevel: 42
            }
        );
    }

    #[test]
    fn missing_makefile_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let err = kernel_version(temp.path()).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(PipelineError::NotFound { .. })
        ));
    }
}
