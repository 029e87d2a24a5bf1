use std::borrow::Cow;
use std::{
    env,
    fs::File,
    io::{self, Read, Write},
    path::Path,
    process::Command,
};

fn main() {
    if let Err(e) = write_version_file() {
        panic!("Failed to create a version file: {:?}", e);
    }
    println!("cargo:rerun-if-env-changed=APKTRAIL_GIT_REVISION");
}

fn write_version_file() -> io::Result<()> {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR");
    let version = env::var("CARGO_PKG_VERSION").expect("CARGO_PKG_VERSION");

    let mut simple = File::create(Path::new(&out_dir).join("simple_version_string"))?;
    write!(&mut simple, "\"{}\"", version)?;

    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".into());
    let git_rev = match get_git_rev() {
        Ok(v) => Cow::Owned(v),
        Err(_) => Cow::Borrowed("unknown"),
    };
    let mut full = File::create(Path::new(&out_dir).join("version_string"))?;
    write!(
        &mut full,
        "r#\"{} ({})\nrev {}\"#",
        version,
        target,
        git_rev.trim(),
    )?;
    Ok(())
}

fn get_git_rev() -> io::Result<String> {
    if let Ok(rev) = env::var("APKTRAIL_GIT_REVISION") {
        return Ok(rev);
    }
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .and_then(|out| {
            if !out.status.success() {
                return Err(io::Error::new(io::ErrorKind::Other, "git rev-parse failed"));
            }
            String::from_utf8(out.stdout)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "rev was not UTF-8"))
        })
        .or_else(|_| git_rev_from_file())
}

fn git_rev_from_file() -> io::Result<String> {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR");
    let head = Path::new(&manifest_dir).join("../.git/refs/heads/main");
    let mut rev = String::new();
    File::open(head)?.read_to_string(&mut rev)?;
    Ok(rev)
}
