use super::*;

fn hash_of(data: &[u8]) -> InfoHash {
    InfoHash::from_info_bytes(data)
}

#[test]
fn test_info_hash_hex_roundtrip() {
    let hash = InfoHash([0xAB; 20]);
    let hex = hash.to_hex();
    assert_eq!(hex.len(), 40);
    assert_eq!(InfoHash::from_hex(&hex).unwrap(), hash);
}

#[test]
fn test_info_hash_from_bytes_invalid() {
    assert!(InfoHash::from_bytes(&[0u8; 19]).is_err());
    assert!(InfoHash::from_hex("abc").is_err());
    assert!(InfoHash::from_hex(&"zz".repeat(20)).is_err());
}

#[test]
fn test_info_hash_matches_sha1() {
    // SHA1("") = da39a3ee5e6b4b0d3255bfef95601890afd80709
    let hash = InfoHash::from_info_bytes(b"");
    assert_eq!(hash.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
}

#[test]
fn test_single_file_layout() {
    let data = b"d6:lengthi4242e4:name8:file.bine";
    let info = TorrentInfo::from_info_dict(&hash_of(data), data).unwrap();

    assert_eq!(info.name, "file.bin");
    assert_eq!(info.total_size, 4242);
    assert_eq!(
        info.files,
        vec![TorrentFile {
            path: "file.bin".into(),
            size: 4242
        }]
    );
}

#[test]
fn test_multi_file_layout() {
    let data =
        b"d5:filesld6:lengthi100e4:pathl3:sub5:a.txteed6:lengthi200e4:pathl5:b.txteee4:name3:dire";
    let info = TorrentInfo::from_info_dict(&hash_of(data), data).unwrap();

    assert_eq!(info.name, "dir");
    assert_eq!(info.total_size, 300);
    assert_eq!(info.files.len(), 2);
    assert_eq!(info.files[0].path, "sub/a.txt");
    assert_eq!(info.files[1].path, "b.txt");
}

#[test]
fn test_missing_name_synthesized_from_hash() {
    let data = b"d6:lengthi10ee";
    let hash = hash_of(data);
    let info = TorrentInfo::from_info_dict(&hash, data).unwrap();
    assert_eq!(info.name, hash.to_hex());
}

#[test]
fn test_zero_total_size_rejected() {
    let data = b"d6:lengthi0e4:name1:xe";
    assert!(matches!(
        TorrentInfo::from_info_dict(&hash_of(data), data),
        Err(MetainfoError::ZeroSize)
    ));
}

#[test]
fn test_traversal_path_rejected() {
    let data = b"d5:filesld6:lengthi10e4:pathl2:..6:secreteee4:name3:dire";
    assert!(matches!(
        TorrentInfo::from_info_dict(&hash_of(data), data),
        Err(MetainfoError::UnsafePath)
    ));
}

#[test]
fn test_single_file_traversal_name_rejected() {
    // In the single-file layout the name becomes the stored path, so the
    // same traversal rules apply to it.
    let data = b"d6:lengthi10e4:name13:../etc/passwde";
    assert!(matches!(
        TorrentInfo::from_info_dict(&hash_of(data), data),
        Err(MetainfoError::UnsafePath)
    ));

    let data = b"d6:lengthi10e4:name2:..e";
    assert!(matches!(
        TorrentInfo::from_info_dict(&hash_of(data), data),
        Err(MetainfoError::UnsafePath)
    ));

    let data = b"d6:lengthi10e4:name3:a\\be";
    assert!(matches!(
        TorrentInfo::from_info_dict(&hash_of(data), data),
        Err(MetainfoError::UnsafePath)
    ));
}

#[test]
fn test_invalid_utf8_replaced() {
    // name = 0xFF 0xFE "x", with NUL in the middle
    let data = b"d6:lengthi10e4:name4:\xff\x00\xfexe";
    let info = TorrentInfo::from_info_dict(&hash_of(data), data).unwrap();
    assert_eq!(info.name, "\u{FFFD}\u{FFFD}x");
    assert!(!info.name.bytes().any(|b| b == 0));
}

#[test]
fn test_negative_length_rejected() {
    let data = b"d6:lengthi-5e4:name1:xe";
    assert!(TorrentInfo::from_info_dict(&hash_of(data), data).is_err());
}
