//! Build script for tunecache
//!
//! This build script handles platform-specific configuration:
//! - Windows: Embeds the application manifest for long path support (>260 chars)
//!
//! # Windows Long Path Support
//!
//! Music libraries routinely nest `Artist\Album (Deluxe Edition)\Disc 1\...`
//! deep enough to pass the 260 character MAX_PATH limit. The manifest
//! (`tunecache.manifest`) sets `longPathAware=true` which, combined with the
//! Windows 10 v1607+ registry setting, enables paths up to 32,767 characters
//! for both our own file access and the paths we hand to external tools.

fn main() {
    #[cfg(windows)]
    {
        // The .rc file references the manifest as an RT_MANIFEST resource
        embed_resource::compile("tunecache.rc", embed_resource::NONE);

        println!("cargo:rerun-if-changed=tunecache.rc");
        println!("cargo:rerun-if-changed=tunecache.manifest");
    }
}
