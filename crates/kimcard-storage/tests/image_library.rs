#![cfg(not(target_arch = "wasm32"))]

use kimcard_storage::{CreateImageOpts, ImageLibrary, LibraryError};
use tempfile::tempdir;

fn opts() -> CreateImageOpts {
    CreateImageOpts {
        cylinders: 1,
        sectors: 2,
        size_code: 1,
        filler: 0xE5,
        packed: true,
    }
}

#[test]
fn create_list_copy_rename_erase() {
    let dir = tempdir().unwrap();
    let lib = ImageLibrary::new(dir.path());

    lib.create("a.imd", &opts()).unwrap();
    lib.create("b.imd", &opts()).unwrap();
    assert_eq!(lib.list().unwrap(), vec!["a.imd", "b.imd"]);

    lib.copy("a.imd", "c.imd", false).unwrap();
    assert!(lib.exists("c.imd").unwrap());

    let err = lib.copy("a.imd", "c.imd", false).unwrap_err();
    assert!(matches!(err, LibraryError::Exists));
    lib.copy("b.imd", "c.imd", true).unwrap();

    lib.rename("c.imd", "d.imd").unwrap();
    assert!(!lib.exists("c.imd").unwrap());
    assert!(lib.exists("d.imd").unwrap());

    lib.erase("d.imd").unwrap();
    assert!(matches!(lib.erase("d.imd").unwrap_err(), LibraryError::NotFound));
}

#[test]
fn created_image_mounts() {
    let dir = tempdir().unwrap();
    let lib = ImageLibrary::new(dir.path());
    lib.create("boot.imd", &opts()).unwrap();

    let disk = lib.open("boot.imd", true).unwrap();
    assert_eq!(disk.cylinders(), 1);
    assert_eq!(disk.heads(), 1);
    assert!(disk.read_only());
}

#[test]
fn open_rejects_non_imd_file() {
    let dir = tempdir().unwrap();
    let lib = ImageLibrary::new(dir.path());
    std::fs::write(dir.path().join("junk.bin"), b"not an image").unwrap();

    let err = lib.open("junk.bin", false).unwrap_err();
    assert!(matches!(err, LibraryError::InvalidImage(_)));
}

#[test]
fn name_validation() {
    assert!(ImageLibrary::validate_name("system.imd").is_ok());
    assert!(ImageLibrary::validate_name("").is_err());
    assert!(ImageLibrary::validate_name("../escape").is_err());
    assert!(ImageLibrary::validate_name("dir/inside").is_err());
    assert!(ImageLibrary::validate_name("ctrl\x07byte").is_err());
    assert!(ImageLibrary::validate_name(&"x".repeat(63)).is_ok());
    assert!(ImageLibrary::validate_name(&"x".repeat(64)).is_err());
}

#[test]
fn rename_refuses_existing_destination() {
    let dir = tempdir().unwrap();
    let lib = ImageLibrary::new(dir.path());
    lib.create("a.imd", &opts()).unwrap();
    lib.create("b.imd", &opts()).unwrap();

    let err = lib.rename("a.imd", "b.imd").unwrap_err();
    assert!(matches!(err, LibraryError::Exists));
    let err = lib.rename("missing.imd", "x.imd").unwrap_err();
    assert!(matches!(err, LibraryError::NotFound));
}
