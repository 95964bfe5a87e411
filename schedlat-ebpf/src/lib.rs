#![no_std]

// Library target so the userspace crate can list this crate as a build dependency.
