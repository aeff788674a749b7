//! ZIP archive format support.
//!
//! Reading and writing per the PKWARE APPNOTE, including ZIP64, Info-ZIP
//! Unicode extras, extended timestamps, ZipCrypto, and WinZip AES.

pub mod crypto;
pub mod encryption;
pub mod header;
pub mod reader;
pub mod writer;

pub use encryption::AesStrength;
pub use reader::{preflight, EntryReader, ZipPreflight, ZipReader, ZipReaderOptions};
pub use writer::{Encryption, EntryOptions, Zip64Mode, ZipWriter};

#[cfg(test)]
mod tests {
    use super::*;
    use ferropack_core::entry::{CompressionMethod, NameSource};
    use ferropack_core::error::ErrorCode;
    use ferropack_core::limits::Profile;
    use ferropack_core::sink::{StreamSink, VecSink};
    use ferropack_core::source::MemorySource;

    fn write_simple(entries: &[(&str, &[u8], EntryOptions)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(VecSink::new());
        for (name, data, options) in entries {
            writer.add(name, data, options).unwrap();
        }
        writer.into_sink().unwrap().into_vec()
    }

    fn reopen(bytes: Vec<u8>, password: Option<&[u8]>) -> ZipReader<MemorySource> {
        let options = ZipReaderOptions {
            password: password.map(|p| p.to_vec()),
            ..Default::default()
        };
        ZipReader::new(MemorySource::new(bytes), options).unwrap()
    }

    #[test]
    fn test_minimal_stored_zip() {
        let bytes = write_simple(&[("hello.txt", b"hello", EntryOptions::stored())]);
        let mut reader = reopen(bytes, None);
        assert_eq!(reader.entries().len(), 1);
        let entry = reader.entries()[0].clone();
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.size, 5);
        assert_eq!(entry.crc32, Some(0x3610A686));
        assert_eq!(entry.method, CompressionMethod::Store);
        assert_eq!(reader.read(0).unwrap(), b"hello");
    }

    #[test]
    fn test_roundtrip_store_deflate_zstd() {
        let payload: Vec<u8> = b"zip round trip payload "
            .iter()
            .copied()
            .cycle()
            .take(50_000)
            .collect();
        for method in [
            CompressionMethod::Store,
            CompressionMethod::Deflate,
            CompressionMethod::Zstd,
        ] {
            let options = EntryOptions {
                method,
                ..EntryOptions::default()
            };
            let bytes = write_simple(&[("data.bin", &payload, options)]);
            let mut reader = reopen(bytes, None);
            let entry = reader.entries()[0].clone();
            assert_eq!(entry.method, method, "method survives the round trip");
            assert_eq!(reader.read(0).unwrap(), payload, "{method} payload differs");
        }
    }

    #[test]
    fn test_streaming_sink_uses_data_descriptors() {
        let mut writer = ZipWriter::new(StreamSink::new(Vec::new()));
        writer
            .add("a.txt", b"descriptor mode", &EntryOptions::default())
            .unwrap();
        writer.close(None).unwrap();
        let bytes = writer.into_sink().unwrap().into_inner();

        // Bit 3 set in the local header flags.
        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        assert_ne!(flags & header::FLAG_DATA_DESCRIPTOR, 0);

        let mut reader = reopen(bytes, None);
        assert_eq!(reader.read(0).unwrap(), b"descriptor mode");
    }

    #[test]
    fn test_patch_mode_clears_descriptor_bit() {
        let bytes = write_simple(&[("a.txt", b"patched", EntryOptions::default())]);
        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        assert_eq!(flags & header::FLAG_DATA_DESCRIPTOR, 0);
        // CRC was patched in place at offset 14.
        let crc = u32::from_le_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]);
        assert_eq!(crc, ferropack_core::crc::Crc32::compute(b"patched"));
    }

    #[test]
    fn test_zipcrypto_roundtrip() {
        let options = EntryOptions {
            encryption: Encryption::ZipCrypto {
                password: b"sesame".to_vec(),
            },
            ..EntryOptions::default()
        };
        let bytes = write_simple(&[("secret.txt", b"zipcrypto payload", options)]);
        let mut reader = reopen(bytes.clone(), Some(&b"sesame"[..]));
        assert!(reader.entries()[0].encrypted);
        assert_eq!(reader.read(0).unwrap(), b"zipcrypto payload");

        // Without a password the open fails up front.
        let mut no_pw = reopen(bytes, None);
        let err = no_pw.read(0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ZipPasswordRequired);
    }

    #[test]
    fn test_aes256_roundtrip_and_wrong_password() {
        let options = EntryOptions {
            method: CompressionMethod::Deflate,
            encryption: Encryption::Aes {
                password: b"p".to_vec(),
                strength: AesStrength::Aes256,
                vendor_version: 2,
            },
            ..EntryOptions::default()
        };
        let bytes = write_simple(&[("aes.txt", b"aes-256 protected data", options)]);

        let mut reader = reopen(bytes.clone(), Some(&b"p"[..]));
        let entry = reader.entries()[0].clone();
        assert!(entry.encrypted);
        assert_eq!(entry.method, CompressionMethod::Deflate);
        // AE-2 zeroes the CRC field.
        assert_eq!(entry.crc32, None);
        assert_eq!(reader.read(0).unwrap(), b"aes-256 protected data");

        let mut wrong = reopen(bytes, Some(&b"not-p"[..]));
        let err = wrong.read(0).unwrap_err();
        assert!(matches!(
            err.code(),
            ErrorCode::ZipBadPassword | ErrorCode::ZipAuthFailed
        ));
    }

    #[test]
    fn test_aes_tamper_fails_auth() {
        let options = EntryOptions {
            method: CompressionMethod::Store,
            encryption: Encryption::Aes {
                password: b"p".to_vec(),
                strength: AesStrength::Aes128,
                vendor_version: 2,
            },
            ..EntryOptions::default()
        };
        let mut bytes = write_simple(&[("aes.bin", &[0x5Au8; 256], options)]);
        // Flip one bit inside the ciphertext (salt 8 + verifier 2 into the
        // payload, past the 30-byte local header and 7-letter name + extra).
        let local_extra_len = u16::from_le_bytes([bytes[28], bytes[29]]) as usize;
        let data_start = 30 + "aes.bin".len() + local_extra_len;
        bytes[data_start + 8 + 2 + 100] ^= 0x01;

        let mut reader = reopen(bytes, Some(&b"p"[..]));
        let err = reader.read(0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ZipAuthFailed);
    }

    #[test]
    fn test_aes_all_strengths() {
        for strength in [AesStrength::Aes128, AesStrength::Aes192, AesStrength::Aes256] {
            let options = EntryOptions {
                method: CompressionMethod::Store,
                encryption: Encryption::Aes {
                    password: b"k".to_vec(),
                    strength,
                    vendor_version: 1,
                },
                ..EntryOptions::default()
            };
            let bytes = write_simple(&[("s.bin", b"strength test", options)]);
            let mut reader = reopen(bytes, Some(&b"k"[..]));
            // AE-1 keeps the CRC.
            assert!(reader.entries()[0].crc32.is_some());
            assert_eq!(reader.read(0).unwrap(), b"strength test");
        }
    }

    #[test]
    fn test_zip64_off_refuses_large_declared_size() {
        let mut writer = ZipWriter::with_zip64(VecSink::new(), Zip64Mode::Off);
        let options = EntryOptions {
            declared_size: Some(0x1_0000_0000),
            ..EntryOptions::stored()
        };
        let err = writer.add("big.bin", b"", &options).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ZipZip64Required);
        // Nothing reached the sink.
        let sink = writer.into_sink().unwrap();
        let bytes = sink.into_vec();
        // Only the EOCD from the close in into_sink.
        assert_eq!(bytes.len(), 22);
    }

    #[test]
    fn test_zip64_forced_roundtrip() {
        let mut writer = ZipWriter::with_zip64(VecSink::new(), Zip64Mode::Force);
        writer
            .add("f.txt", b"forced zip64", &EntryOptions::stored())
            .unwrap();
        writer.close(Some("archive comment")).unwrap();
        let bytes = writer.into_sink().unwrap().into_vec();

        let mut reader = reopen(bytes, None);
        assert!(reader.entries()[0].zip64);
        assert!(reader.tail().zip64);
        assert_eq!(reader.comment(), Some("archive comment"));
        assert_eq!(reader.read(0).unwrap(), b"forced zip64");
    }

    #[test]
    fn test_unicode_names_use_utf8_flag() {
        let bytes = write_simple(&[("café/naïve.txt", b"unicode", EntryOptions::stored())]);
        let mut reader = reopen(bytes, None);
        let entry = reader.entries()[0].clone();
        assert_eq!(entry.name, "café/naïve.txt");
        assert_eq!(entry.name_source, NameSource::Utf8);
        assert_eq!(reader.read(0).unwrap(), b"unicode");
    }

    #[test]
    fn test_unicode_path_extra_override() {
        // Hand-build a CP437 entry with a 0x7075 extra carrying UTF-8.
        use ferropack_core::crc::Crc32;
        let raw_name = vec![0x63, 0x61, 0x66, 0x82]; // "café" in CP437
        let mut unicode = vec![1u8];
        unicode.extend_from_slice(&Crc32::compute(&raw_name).to_le_bytes());
        unicode.extend_from_slice("café".as_bytes());

        // Write a plain entry, then patch its name bytes and extras via a
        // manual record rebuild: simplest is to build the whole file by hand.
        let payload = b"x";
        let crc = Crc32::compute(payload);
        let mut file = Vec::new();
        // Local header.
        file.extend_from_slice(&0x04034B50u32.to_le_bytes());
        file.extend_from_slice(&20u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes()); // store
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&crc.to_le_bytes());
        file.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        file.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        file.extend_from_slice(&(raw_name.len() as u16).to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&raw_name);
        file.extend_from_slice(payload);
        // Central directory.
        let cd_offset = file.len() as u32;
        let mut extra = Vec::new();
        extra.extend_from_slice(&0x7075u16.to_le_bytes());
        extra.extend_from_slice(&(unicode.len() as u16).to_le_bytes());
        extra.extend_from_slice(&unicode);
        file.extend_from_slice(&0x02014B50u32.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&20u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&crc.to_le_bytes());
        file.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        file.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        file.extend_from_slice(&(raw_name.len() as u16).to_le_bytes());
        file.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes()); // local offset
        file.extend_from_slice(&raw_name);
        file.extend_from_slice(&extra);
        let cd_size = file.len() as u32 - cd_offset;
        // EOCD.
        file.extend_from_slice(&0x06054B50u32.to_le_bytes());
        file.extend_from_slice(&[0u8; 4]);
        file.extend_from_slice(&1u16.to_le_bytes());
        file.extend_from_slice(&1u16.to_le_bytes());
        file.extend_from_slice(&cd_size.to_le_bytes());
        file.extend_from_slice(&cd_offset.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());

        let mut reader = reopen(file, None);
        let entry = reader.entries()[0].clone();
        assert_eq!(entry.name, "café");
        assert_eq!(entry.name_source, NameSource::UnicodeExtra);
        assert_eq!(reader.read(0).unwrap(), b"x");
    }

    #[test]
    fn test_false_eocd_inside_comment_is_skipped() {
        let mut writer = ZipWriter::new(VecSink::new());
        writer
            .add("a.txt", b"comment test", &EntryOptions::stored())
            .unwrap();
        // A comment that contains a fake EOCD signature.
        let mut comment = String::from("prefix ");
        comment.push_str(std::str::from_utf8(b"PK\x05\x06").unwrap_or("PK56"));
        comment.push_str(" suffix");
        writer.close(Some(&comment)).unwrap();
        let bytes = writer.into_sink().unwrap().into_vec();

        let mut reader = reopen(bytes, None);
        assert_eq!(reader.entries().len(), 1);
        assert_eq!(reader.read(0).unwrap(), b"comment test");
    }

    #[test]
    fn test_trailing_garbage_strict_vs_compat() {
        let mut bytes = write_simple(&[("a.txt", b"x", EntryOptions::stored())]);
        bytes.extend_from_slice(b"GARBAGE");

        let strict = ZipReader::new(MemorySource::new(bytes.clone()), ZipReaderOptions::default());
        assert!(strict.is_err());

        let compat = ZipReader::new(
            MemorySource::new(bytes),
            ZipReaderOptions {
                profile: Profile::Compat,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(compat
            .notes()
            .iter()
            .any(|n| n.code == "ZIP_EOCD_NOT_AT_EOF"));
    }

    #[test]
    fn test_corrupt_payload_fails_crc() {
        let mut bytes = write_simple(&[("c.bin", b"crc protected payload", EntryOptions::stored())]);
        // Flip a byte of the stored payload (right after the local header).
        let data_start = 30 + "c.bin".len();
        bytes[data_start + 3] ^= 0xFF;
        let mut reader = reopen(bytes, None);
        let err = reader.read(0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ZipBadCrc);
    }

    #[test]
    fn test_preflight_reports_directory_cost() {
        let bytes = write_simple(&[
            ("a.txt", b"a", EntryOptions::stored()),
            ("b.txt", b"b", EntryOptions::stored()),
        ]);
        let mut source = MemorySource::new(bytes);
        let summary = preflight(&mut source, &ferropack_core::limits::ResourceLimits::DEFAULT)
            .unwrap();
        assert_eq!(summary.total_entries, 2);
        assert!(summary.cd_size > 0);
        assert!(!summary.zip64);

        let mut limits = ferropack_core::limits::ResourceLimits::DEFAULT;
        limits.max_entries = 1;
        let err = preflight(&mut source, &limits).unwrap_err();
        assert!(err.context().unwrap().contains_key("requiredEntries"));
    }

    #[test]
    fn test_directory_entries() {
        let mut writer = ZipWriter::new(VecSink::new());
        writer.add_directory("docs").unwrap();
        writer
            .add("docs/readme.txt", b"hi", &EntryOptions::stored())
            .unwrap();
        writer.close(None).unwrap();
        let reader = reopen(writer.into_sink().unwrap().into_vec(), None);
        assert!(reader.entries()[0].is_dir());
        assert_eq!(reader.entries()[0].name, "docs/");
        assert!(reader.entries()[1].is_file());
    }
}
