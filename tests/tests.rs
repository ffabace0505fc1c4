use respatch::{constants::*, *};
use std::{
    cell::RefCell,
    fs,
    io,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Once,
};

static INIT_LOGGER: Once = Once::new();
fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .format_timestamp(None)
            .format_module_path(false)
            .format_level(true)
            .format_target(false)
            .write_style(env_logger::WriteStyle::Auto)
            .init();
    });
}

const TEXT_FILL: u8 = 0xC3;

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Minimal PE32+ image with a single code section at the given file offset and no resources.
fn synthesize_image(text_offset: u32) -> Vec<u8> {
    let mut data = vec![0u8; text_offset as usize + 0x200];
    data[0..2].copy_from_slice(b"MZ");
    put_u32(&mut data, 0x3c, 0x40);
    data[0x40..0x44].copy_from_slice(b"PE\0\0");

    // coff header
    put_u16(&mut data, 0x44, 0x8664);
    put_u16(&mut data, 0x46, 1);
    put_u16(&mut data, 0x54, 240);
    put_u16(&mut data, 0x56, 0x22);

    // optional header
    put_u16(&mut data, 0x58, 0x20b);
    put_u32(&mut data, 0x74, 0x1);
    put_u32(&mut data, 0x78, 0x1000);
    put_u32(&mut data, 0x7c, 0x200);
    put_u32(&mut data, 0x90, 0x2000);
    put_u32(&mut data, 0x94, 0x200);
    put_u32(&mut data, 0x98, 0x1234);
    put_u16(&mut data, 0x9c, 3);
    put_u32(&mut data, 0xc4, 16);

    // section table
    data[0x148..0x150].copy_from_slice(b".text\0\0\0");
    put_u32(&mut data, 0x150, 0x100);
    put_u32(&mut data, 0x154, 0x1000);
    put_u32(&mut data, 0x158, 0x200);
    put_u32(&mut data, 0x15c, text_offset);
    put_u32(&mut data, 0x16c, 0x60000020);

    data[text_offset as usize..].fill(TEXT_FILL);
    data
}

fn payload(seed: u8, length: usize) -> Vec<u8> {
    (0..length).map(|index| seed.wrapping_add(index as u8)).collect()
}

/// Icon container holding the given images, square sizes 16, 32, 48 and so on.
fn synthesize_icon(images: &[Vec<u8>]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend(0u16.to_le_bytes());
    data.extend(1u16.to_le_bytes());
    data.extend((images.len() as u16).to_le_bytes());
    let mut offset = 6 + 16 * images.len();
    for (index, image) in images.iter().enumerate() {
        let size = (16 * (index + 1)) as u8;
        data.extend([size, size, 0, 0]);
        data.extend(1u16.to_le_bytes());
        data.extend(32u16.to_le_bytes());
        data.extend((image.len() as u32).to_le_bytes());
        data.extend((offset as u32).to_le_bytes());
        offset += image.len();
    }
    for image in images {
        data.extend(image);
    }
    data
}

fn sample_images() -> Vec<Vec<u8>> { vec![payload(1, 40), payload(50, 104), payload(200, 257)] }

fn write_image(directory: &Path, data: &[u8]) -> PathBuf {
    let path = directory.join("target.exe");
    fs::write(&path, data).unwrap();
    path
}

fn align4(value: usize) -> usize { (value + 3) & !3 }

fn u16_at(data: &[u8], offset: usize) -> u16 { u16::from_le_bytes([data[offset], data[offset + 1]]) }

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn key_at(data: &[u8], offset: usize) -> (String, usize) {
    let mut units = Vec::new();
    let mut position = offset;
    loop {
        let unit = u16_at(data, position);
        position += 2;
        if unit == 0 {
            return (String::from_utf16(&units).unwrap(), position);
        }
        units.push(unit);
    }
}

/// Walk a serialized version block and assert that its declared length covers exactly its contents.
fn check_block_spans(data: &[u8], offset: usize) -> usize {
    let length = u16_at(data, offset) as usize;
    let value_length = u16_at(data, offset + 2) as usize;
    let block_type = u16_at(data, offset + 4);
    let (key, key_end) = key_at(data, offset + 6);
    let value_start = align4(key_end);
    let end = offset + length;
    let value_end = if key == "VS_VERSION_INFO" {
        value_start + 52
    } else if value_length == 0 {
        value_start
    } else if block_type == 1 {
        value_start + (value_length + 1) * 2
    } else {
        value_start + value_length * 2
    };

    let mut content_end = value_end;
    let mut position = align4(value_end);
    while position < end {
        content_end = position + check_block_spans(data, position);
        position = align4(content_end);
    }
    assert_eq!(content_end, end, "{} spans exactly its declared length", key);
    length
}

fn full_version_info() -> VersionInfo {
    let mut version_info = VersionInfo {
        company_name: "Example Corp".into(),
        file_description: "Example application".into(),
        product_name: "Example".into(),
        ..Default::default()
    };
    version_info.set_file_version("1.2.3.4");
    version_info.set_product_version("5.6.7");
    version_info
}

#[derive(Debug, Default)]
struct RecordingSession {
    fail_update: bool,
    events:      Rc<RefCell<Vec<String>>>,
}
impl UpdateSession for RecordingSession {
    fn begin(_: &Path) -> Result<Self, SessionError> { Ok(Self::default()) }

    fn update(&mut self, record: &ResourceRecord) -> Result<(), SessionError> {
        self.events
            .borrow_mut()
            .push(format!("update {}/{}", record.resource_type, record.id));
        if self.fail_update {
            return Err(SessionError::IOError(io::Error::other("update rejected")));
        }
        Ok(())
    }

    fn end(self, commit: bool) -> Result<(), SessionError> {
        self.events.borrow_mut().push(format!("end {}", commit));
        Ok(())
    }
}

#[test]
fn icon_group_record_ids_follow_container_order() {
    init_logger();

    let images = sample_images();
    let icon = synthesize_icon(&images);
    let directory = IconDirectory::parse(&icon).unwrap();
    assert_eq!(directory.len(), 3);

    let (group, resources) = directory.to_group_record();
    assert_eq!(resources.iter().map(|resource| resource.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    for (resource, image) in resources.iter().zip(&images) {
        assert_eq!(&resource.data, image, "image data is copied unchanged");
    }

    let entries = group.entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries.iter().map(|entry| entry.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(entries[1].width, 32);
    assert_eq!(entries[2].bytes, 257);
    assert_eq!(entries[0].bit_count, 32);

    let data = group.build();
    assert_eq!(data.len(), 6 + 3 * 14);
    assert_eq!(&data[..6], &[0, 0, 1, 0, 3, 0]);
    // first entry: 16x16, 1 plane, 32 bits, 40 bytes, id 1
    assert_eq!(&data[6..20], &[16, 16, 0, 0, 1, 0, 32, 0, 40, 0, 0, 0, 1, 0]);
    assert_eq!(GroupIconRecord::parse(&data).unwrap(), group);
}

#[test]
fn icon_group_record_uses_icon_container_type() {
    init_logger();

    let icon = synthesize_icon(&sample_images());
    let (group, _) = IconDirectory::parse(&icon).unwrap().to_group_record();
    let mut data = group.build();
    assert_eq!(u16_at(&data, 2), ICON_CONTAINER_TYPE_ICON);

    // cursor groups use container type 2
    put_u16(&mut data, 2, 2);
    assert!(matches!(GroupIconRecord::parse(&data), Err(ResourceError::InvalidRecord(_))));
}

#[test]
fn icon_rejects_cursor_container() {
    init_logger();

    let mut icon = synthesize_icon(&sample_images());
    icon[2] = 2;
    assert_eq!(IconDirectory::parse(&icon), Err(IconError::InvalidType(2)));
}

#[test]
fn icon_rejects_invalid_headers() {
    init_logger();

    assert_eq!(IconDirectory::parse(&[0, 0, 1, 0]), Err(IconError::Truncated(4)));
    assert_eq!(IconDirectory::parse(&[0, 0, 1, 0, 0, 0]), Err(IconError::Empty));
    assert_eq!(IconDirectory::parse(&[1, 0, 1, 0, 1, 0]), Err(IconError::InvalidReserved(1)));

    // two images announced, one entry present
    let mut icon = synthesize_icon(&[payload(0, 8)]);
    icon[4] = 2;
    icon.truncate(6 + 16);
    assert_eq!(IconDirectory::parse(&icon), Err(IconError::Truncated(22)));
}

#[test]
fn icon_rejects_images_outside_container() {
    init_logger();

    let mut icon = synthesize_icon(&sample_images());
    let size = icon.len();
    // move the second image past the end of the container
    icon[6 + 16 + 12..6 + 16 + 16].copy_from_slice(&(size as u32 - 50).to_le_bytes());
    assert!(matches!(
        IconDirectory::parse(&icon),
        Err(IconError::ImageOutOfBounds { index: 1, length: 104, .. })
    ));
}

#[test]
fn version_block_lengths_match_spans() {
    init_logger();

    let record = full_version_info().build().unwrap();
    let data = record.data();
    assert_eq!(data.len() % 2, 0);
    assert_eq!(check_block_spans(data, 0), data.len(), "root spans the whole record");

    let empty = VersionInfo::default().build().unwrap();
    assert_eq!(check_block_spans(empty.data(), 0), empty.data().len());
}

#[test]
fn version_empty_info_has_empty_string_table() {
    init_logger();

    let record = VersionInfo::default().build().unwrap();
    let string_file_info = record.root().child("StringFileInfo").unwrap();
    assert_eq!(string_file_info.block_type(), BlockType::Text);
    let string_table = record.string_table().unwrap();
    assert_eq!(string_table.key(), "040904B0");
    assert!(string_table.children().is_empty());

    let var_file_info = record.root().child("VarFileInfo").unwrap();
    assert_eq!(var_file_info.block_type(), BlockType::Binary);
    let translation = var_file_info.child("Translation").unwrap();
    assert_eq!(translation.value_length(), 2);
    // one little-endian dword in the same encoding as the string table key
    assert_eq!(translation.value(), &[0xB0, 0x04, 0x09, 0x04]);
    assert_eq!(translation.value(), &VS_TRANSLATION_VALUE.to_le_bytes());
    assert_eq!(record.translation(), Some(0x040904B0));
}

#[test]
fn version_fixed_info_packs_version_parts() {
    init_logger();

    let version_info = VersionInfo {
        file_version_parts: [1, 2, 3, 4],
        product_version_parts: [1, 2, 3, 4],
        ..Default::default()
    };
    let record = version_info.build().unwrap();
    let data = record.data();

    // 6 byte header and "VS_VERSION_INFO\0" padded to 40 bytes
    assert_eq!(u16_at(data, 2), 52, "root value length is the fixed file info size");
    assert_eq!(u16_at(data, 4), 0, "root block is binary");
    assert_eq!(u32_at(data, 40), 0xFEEF04BD);
    assert_eq!(u32_at(data, 44), 0x00010000);
    assert_eq!(u32_at(data, 48), (1 << 16) | 2);
    assert_eq!(u32_at(data, 52), (3 << 16) | 4);
    assert_eq!(u32_at(data, 56), (1 << 16) | 2);
    assert_eq!(u32_at(data, 60), (3 << 16) | 4);
    assert_eq!(u32_at(data, 64), 0x3F);
    assert_eq!(u32_at(data, 72), 0x00040004);
    assert_eq!(u32_at(data, 76), 1);

    let fixed_file_info = record.fixed_file_info().unwrap();
    assert_eq!(fixed_file_info.file_version(), [1, 2, 3, 4]);
    assert_eq!(fixed_file_info.product_version(), [1, 2, 3, 4]);
}

#[test]
fn version_strings_are_omitted_when_empty() {
    init_logger();

    let version_info = VersionInfo {
        company_name: "Example Corp".into(),
        product_name: "Example".into(),
        ..Default::default()
    };
    let record = version_info.build().unwrap();
    let keys = record
        .string_table()
        .unwrap()
        .children()
        .iter()
        .map(|block| block.key().to_string())
        .collect::<Vec<_>>();
    assert_eq!(keys, vec!["CompanyName", "ProductName"]);
    assert_eq!(record.string("ProductName").as_deref(), Some("Example"));
    assert_eq!(record.string("FileVersion"), None);

    let record = full_version_info().build().unwrap();
    let keys = record
        .string_table()
        .unwrap()
        .children()
        .iter()
        .map(|block| block.key().to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        keys,
        vec!["CompanyName", "FileDescription", "FileVersion", "ProductName", "ProductVersion"]
    );
}

#[test]
fn version_text_value_length_counts_characters() {
    init_logger();

    let block = VersionBlock::text("CompanyName", "Acme");
    assert_eq!(block.value_length(), 4);
    assert_eq!(block.value().len(), 10, "value includes the terminator");
    assert_eq!(block.text_value().as_deref(), Some("Acme"));
    // 6 byte header, 24 byte key padded to 32, 10 byte value
    assert_eq!(block.length(), 42);
}

#[test]
fn version_record_parses_back() {
    init_logger();

    let version_info = full_version_info();
    let record = version_info.build().unwrap();
    let parsed = VersionRecord::parse(record.data()).unwrap();
    assert_eq!(parsed, record);
    assert_eq!(parsed.version_info(), version_info);

    assert!(VersionRecord::parse(&record.data()[..20]).is_err());
}

#[test]
fn version_rejects_oversized_records() {
    init_logger();

    let version_info = VersionInfo {
        file_description: "x".repeat(40_000),
        ..Default::default()
    };
    assert!(matches!(version_info.build(), Err(VersionInfoError::SizeOverflow { size, .. }) if size > 0xFFFF));
}

#[test]
fn version_parts_from_strings() {
    assert_eq!(parse_version_parts("1.2.3"), [1, 2, 3, 0]);
    assert_eq!(parse_version_parts("v10.0.1-beta.5"), [10, 0, 1, 0]);
    assert_eq!(parse_version_parts("1.2.3-rc1.4"), [1, 2, 3, 0]);
    assert_eq!(parse_version_parts("2.0-beta.7.9"), [2, 0, 0, 0]);
    assert_eq!(parse_version_parts("1.2b.3"), [1, 2, 0, 0]);
    assert_eq!(parse_version_parts(""), [0, 0, 0, 0]);
    assert_eq!(parse_version_parts("70000.1"), [65535, 1, 0, 0]);
    assert_eq!(parse_version_parts("1.2.3.4.5"), [1, 2, 3, 4]);
    assert_eq!(parse_version_parts("release"), [0, 0, 0, 0]);
}

#[test]
fn transaction_without_records_leaves_file_unchanged() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let original = synthesize_image(0x200);
    let path = write_image(directory.path(), &original);

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    assert_eq!(transaction.staged_count(), 0);
    assert_eq!(transaction.finalize().unwrap(), Outcome::NothingStaged);
    assert!(transaction.is_terminal());
    assert_eq!(fs::read(&path).unwrap(), original);

    assert!(matches!(transaction.finalize(), Err(TransactionError::InvalidState)));
    assert!(matches!(
        transaction.stage_asset(vec![1, 2, 3]),
        Err(TransactionError::InvalidState)
    ));
    assert!(matches!(
        transaction.stage_version_info(&VersionInfo::default()),
        Err(TransactionError::InvalidState)
    ));
}

#[test]
fn transaction_commits_icon_resources() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let path = write_image(directory.path(), &synthesize_image(0x200));
    let images = sample_images();
    let icon = synthesize_icon(&images);

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    transaction.stage_icon(&icon).unwrap();
    assert_eq!(transaction.staged_count(), 4);
    assert_eq!(transaction.finalize().unwrap(), Outcome::Committed { records: 4 });

    let data = fs::read(&path).unwrap();
    let image = Image::parse(&data[..]).unwrap();
    let resources = image.resource_directory().unwrap();
    assert_eq!(resources.ids(RT_ICON), vec![1, 2, 3]);
    assert_eq!(resources.ids(RT_GROUP_ICON), vec![1]);
    assert_eq!(resources.root().entries().len(), 2, "only icon resource types are present");
    for (id, image) in (1..).zip(&images) {
        let resource = resources.get(RT_ICON, id, LANGUAGE_ID_EN_US).unwrap();
        assert_eq!(resource.data(), &image[..]);
    }

    let (group, _) = IconDirectory::parse(&icon).unwrap().to_group_record();
    let stored = resources.get(RT_GROUP_ICON, 1, LANGUAGE_ID_EN_US).unwrap();
    assert_eq!(stored.data(), &group.build()[..]);
}

#[test]
fn transaction_commits_all_resource_kinds() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let path = write_image(directory.path(), &synthesize_image(0x200));
    let icon_path = directory.path().join("app.ico");
    fs::write(&icon_path, synthesize_icon(&[payload(7, 64), payload(9, 96)])).unwrap();
    let asset_path = directory.path().join("asset.bin");
    let asset = payload(3, 2000);
    fs::write(&asset_path, &asset).unwrap();

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    transaction.stage_asset_file(&asset_path).unwrap();
    transaction.stage_icon_file(&icon_path).unwrap();
    transaction.stage_version_info(&full_version_info()).unwrap();
    assert_eq!(transaction.finalize().unwrap(), Outcome::Committed { records: 5 });

    let data = fs::read(&path).unwrap();
    assert!(data[0x200..0x400].iter().all(|byte| *byte == TEXT_FILL), "code section is preserved");

    let image = Image::parse(&data[..]).unwrap();
    assert_eq!(image.section_table().len(), 2);
    let section = image.section_table()[1];
    assert_eq!(section.name(), Some(".rsrc"));
    let (virtual_address, pointer_to_raw_data) = (section.virtual_address, section.pointer_to_raw_data);
    assert_eq!(virtual_address, 0x2000);
    assert_eq!(pointer_to_raw_data, 0x400);

    let resource_table = image.data_directory(DataDirectoryType::ResourceTable).unwrap();
    assert_eq!({ resource_table.virtual_address }, 0x2000);
    assert_eq!(image.windows_header().size_of_image(), 0x3000);
    assert_eq!(u32_at(&data, 0x98), 0, "checksum is cleared");

    let resources = image.resource_directory().unwrap();
    let stored = resources.get(RT_RCDATA, ASSET_RESOURCE_ID, LANGUAGE_ID_EN_US).unwrap();
    assert_eq!(stored.data(), &asset[..]);
    assert_eq!(resources.ids(RT_ICON), vec![1, 2]);

    let version = resources.get(RT_VERSION, VERSION_RESOURCE_ID, LANGUAGE_ID_EN_US).unwrap();
    let record = VersionRecord::parse(version.data()).unwrap();
    assert_eq!(record.string("CompanyName").as_deref(), Some("Example Corp"));
    assert_eq!(record.fixed_file_info().unwrap().file_version(), [1, 2, 3, 4]);
    assert_eq!(record.fixed_file_info().unwrap().product_version(), [5, 6, 7, 0]);
}

#[test]
fn transaction_replaces_records_with_same_identity() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let path = write_image(directory.path(), &synthesize_image(0x200));

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    transaction.stage_asset(payload(1, 100)).unwrap();
    transaction.stage_asset(payload(2, 30)).unwrap();
    assert_eq!(transaction.staged_count(), 1);
    assert_eq!(transaction.finalize().unwrap(), Outcome::Committed { records: 1 });

    let data = fs::read(&path).unwrap();
    let image = Image::parse(&data[..]).unwrap();
    let stored = image
        .resource_directory()
        .unwrap()
        .get(RT_RCDATA, ASSET_RESOURCE_ID, LANGUAGE_ID_EN_US)
        .unwrap();
    assert_eq!(stored.data(), &payload(2, 30)[..]);
}

#[test]
fn transaction_updates_existing_resources() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let path = write_image(directory.path(), &synthesize_image(0x200));

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    transaction.stage_icon(&synthesize_icon(&sample_images())).unwrap();
    transaction.finalize().unwrap();

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    transaction.stage_asset(payload(5, 12_000)).unwrap();
    transaction.finalize().unwrap();

    let data = fs::read(&path).unwrap();
    let image = Image::parse(&data[..]).unwrap();
    assert_eq!(image.section_table().len(), 2, "the resource section is grown, not duplicated");
    let resources = image.resource_directory().unwrap();
    assert_eq!(resources.ids(RT_ICON), vec![1, 2, 3]);
    assert_eq!(
        resources.get(RT_ICON, 3, LANGUAGE_ID_EN_US).unwrap().data(),
        &sample_images()[2][..]
    );
    assert_eq!(
        resources.get(RT_RCDATA, ASSET_RESOURCE_ID, LANGUAGE_ID_EN_US).unwrap().data(),
        &payload(5, 12_000)[..]
    );
}

#[test]
fn transaction_rejects_oversized_records() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let path = write_image(directory.path(), &synthesize_image(0x200));

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    assert!(matches!(
        transaction.stage(RT_VERSION, VERSION_RESOURCE_ID, LANGUAGE_ID_EN_US, vec![0; 70_000]),
        Err(TransactionError::Stage(_))
    ));
    let version_info = VersionInfo {
        company_name: "x".repeat(40_000),
        ..Default::default()
    };
    assert!(matches!(
        transaction.stage_version_info(&version_info),
        Err(TransactionError::SizeOverflow(_))
    ));
    assert_eq!(transaction.staged_count(), 0);
    assert!(!transaction.is_terminal());

    // large opaque blobs are not bound by the version record limit
    transaction.stage_asset(vec![0; 70_000]).unwrap();
    assert_eq!(transaction.staged_count(), 1);
}

#[test]
fn transaction_rejects_invalid_icon() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let path = write_image(directory.path(), &synthesize_image(0x200));

    let mut icon = synthesize_icon(&sample_images());
    icon[2] = 2;
    let mut transaction = ResourceTransaction::open(&path).unwrap();
    assert!(matches!(
        transaction.stage_icon(&icon),
        Err(TransactionError::Format(IconError::InvalidType(2)))
    ));
    assert_eq!(transaction.staged_count(), 0);

    assert!(matches!(
        transaction.stage_icon_file(directory.path().join("missing.ico")),
        Err(TransactionError::IOError(_))
    ));
}

#[test]
fn transaction_failed_commit_leaves_file_unchanged() {
    init_logger();

    // the section table has no room for a resource section header
    let directory = tempfile::tempdir().unwrap();
    let original = synthesize_image(0x180);
    let path = write_image(directory.path(), &original);

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    transaction.stage_asset(payload(1, 100)).unwrap();
    assert!(matches!(
        transaction.finalize(),
        Err(TransactionError::Commit(SessionError::Build(ImageWriteError::NotEnoughSpaceInHeader)))
    ));
    assert!(transaction.is_terminal());
    assert_eq!(transaction.staged_count(), 0);
    assert_eq!(fs::read(&path).unwrap(), original);
    assert_eq!(fs::read_dir(directory.path()).unwrap().count(), 1, "no temporary files remain");

    // the lock is released
    let mut transaction = ResourceTransaction::open(&path).unwrap();
    assert_eq!(transaction.finalize().unwrap(), Outcome::NothingStaged);
}

#[test]
fn transaction_failed_update_discards_session() {
    init_logger();

    let events = Rc::new(RefCell::new(Vec::new()));
    let session = RecordingSession {
        fail_update: true,
        events:      events.clone(),
    };
    let mut transaction = ResourceTransaction::with_session("target.exe", session);
    transaction.stage_asset(vec![1]).unwrap();
    transaction.stage_version_info(&VersionInfo::default()).unwrap();
    assert!(matches!(
        transaction.finalize(),
        Err(TransactionError::Commit(SessionError::IOError(_)))
    ));
    assert!(transaction.is_terminal());
    assert_eq!(*events.borrow(), vec!["update 10/1004", "end false"]);
}

#[test]
fn transaction_applies_records_in_staging_order() {
    init_logger();

    let events = Rc::new(RefCell::new(Vec::new()));
    let session = RecordingSession {
        fail_update: false,
        events:      events.clone(),
    };
    let mut transaction = ResourceTransaction::with_session("target.exe", session);
    transaction.stage_version_info(&VersionInfo::default()).unwrap();
    transaction.stage_asset(vec![1]).unwrap();
    transaction.stage_version_info(&full_version_info()).unwrap();
    assert_eq!(transaction.finalize().unwrap(), Outcome::Committed { records: 2 });
    assert_eq!(*events.borrow(), vec!["update 16/1", "update 10/1004", "end true"]);
}

#[test]
fn transaction_dropped_without_finalize_discards_session() {
    init_logger();

    let events = Rc::new(RefCell::new(Vec::new()));
    {
        let mut transaction = ResourceTransaction::with_session("target.exe", RecordingSession {
            fail_update: false,
            events:      events.clone(),
        });
        transaction.stage_asset(vec![1, 2, 3]).unwrap();
    }
    assert_eq!(*events.borrow(), vec!["end false"]);

    let directory = tempfile::tempdir().unwrap();
    let original = synthesize_image(0x200);
    let path = write_image(directory.path(), &original);
    {
        let mut transaction = ResourceTransaction::open(&path).unwrap();
        transaction.stage_asset(payload(4, 64)).unwrap();
    }
    assert_eq!(fs::read(&path).unwrap(), original);
    let mut transaction = ResourceTransaction::open(&path).unwrap();
    assert_eq!(transaction.finalize().unwrap(), Outcome::NothingStaged);
}

#[test]
fn transaction_holds_exclusive_access() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let path = write_image(directory.path(), &synthesize_image(0x200));

    let first = ResourceTransaction::open(&path).unwrap();
    assert!(matches!(
        ResourceTransaction::open(&path),
        Err(TransactionError::Session(SessionError::Locked(_)))
    ));
    drop(first);
    assert!(ResourceTransaction::open(&path).is_ok());
}

#[test]
fn transaction_commit_releases_lock_and_replaces_target() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let path = write_image(directory.path(), &synthesize_image(0x200));

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    transaction.stage_asset(payload(4, 300)).unwrap();
    assert_eq!(transaction.finalize().unwrap(), Outcome::Committed { records: 1 });

    // only the replaced target is left behind
    let names = fs::read_dir(directory.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect::<Vec<_>>();
    assert_eq!(names, vec![std::ffi::OsString::from("target.exe")]);

    let mut transaction = ResourceTransaction::open(&path).unwrap();
    transaction.stage_asset(payload(5, 200)).unwrap();
    assert_eq!(transaction.finalize().unwrap(), Outcome::Committed { records: 1 });
    drop(transaction);

    let data = fs::read(&path).unwrap();
    let image = Image::parse(&data[..]).unwrap();
    let resources = image.resource_directory().unwrap();
    let stored = resources.get(RT_RCDATA, ASSET_RESOURCE_ID, LANGUAGE_ID_EN_US).unwrap();
    assert_eq!(stored.data(), &payload(5, 200)[..]);
    assert!(ResourceTransaction::open(&path).is_ok());
}

#[test]
fn transaction_open_fails_for_invalid_targets() {
    init_logger();

    let directory = tempfile::tempdir().unwrap();
    let missing = ResourceTransaction::open(directory.path().join("missing.exe")).unwrap_err();
    assert!(matches!(missing, TransactionError::Session(SessionError::IOError(_))));
    assert_eq!(missing.os_error_code(), Some(2));

    let path = write_image(directory.path(), b"not an executable image");
    assert!(matches!(
        ResourceTransaction::open(&path),
        Err(TransactionError::Session(SessionError::InvalidImage(_)))
    ));
}

#[test]
fn image_resource_section_is_grown_and_rewritten() {
    init_logger();

    let original = synthesize_image(0x200);
    let mut image = Image::parse(&original[..]).unwrap();
    assert!(image.resource_directory().is_none());

    let mut resources = ResourceDirectory::default();
    resources.set(RT_RCDATA, ASSET_RESOURCE_ID, LANGUAGE_ID_EN_US, payload(1, 100));
    assert!(image.set_resource_directory(resources).unwrap().is_none());
    let appended = image.data().to_vec();
    assert_eq!(appended.len(), 0x600);

    // a larger directory extends the trailing resource section
    let mut image = Image::parse(&appended[..]).unwrap();
    let mut resources = image.resource_directory().cloned().unwrap();
    resources.set(RT_RCDATA, 2, LANGUAGE_ID_EN_US, payload(2, 5000));
    image.set_resource_directory(resources).unwrap();
    let extended = image.data().to_vec();
    assert_eq!(image.section_table().len(), 2);
    let section = image.section_table()[1];
    let (raw_size, virtual_address) = (section.size_of_raw_data, section.virtual_address);
    assert_eq!(virtual_address, 0x2000);
    assert_eq!(raw_size as usize, extended.len() - 0x400);
    assert_eq!(raw_size % 0x200, 0);
    assert_eq!(image.windows_header().size_of_image(), 0x4000);

    // a smaller directory is written in place
    let mut image = Image::parse(&extended[..]).unwrap();
    let mut resources = image.resource_directory().cloned().unwrap();
    resources.set(RT_RCDATA, 2, LANGUAGE_ID_EN_US, payload(3, 10));
    image.set_resource_directory(resources).unwrap();
    assert_eq!(image.data().len(), extended.len());

    let image = Image::parse(image.data()).unwrap();
    let resources = image.resource_directory().unwrap();
    assert_eq!(resources.ids(RT_RCDATA), vec![2, 1004]);
    assert_eq!(resources.get(RT_RCDATA, 2, LANGUAGE_ID_EN_US).unwrap().data(), &payload(3, 10)[..]);
    assert_eq!(
        resources.get(RT_RCDATA, ASSET_RESOURCE_ID, LANGUAGE_ID_EN_US).unwrap().data(),
        &payload(1, 100)[..]
    );
}

#[test]
fn image_appended_section_preserves_overlay_and_drops_signature() {
    init_logger();

    let mut original = synthesize_image(0x200);
    // certificate table entry pointing at trailing data
    put_u32(&mut original, 0xe8, 0x400);
    put_u32(&mut original, 0xec, 16);
    original.extend(payload(9, 16));

    let mut image = Image::parse(&original[..]).unwrap();
    let mut resources = ResourceDirectory::default();
    resources.set(RT_VERSION, VERSION_RESOURCE_ID, LANGUAGE_ID_EN_US, payload(1, 64));
    image.set_resource_directory(resources).unwrap();

    let data = image.data();
    assert_eq!(&data[data.len() - 16..], &payload(9, 16)[..]);
    let certificate = image.data_directory(DataDirectoryType::CertificateTable).unwrap();
    assert_eq!(({ certificate.virtual_address }, { certificate.size }), (0, 0));
}

#[test]
fn resource_directory_keeps_ids_ordered() {
    init_logger();

    let mut resources = ResourceDirectory::default();
    for id in [9, 2, 5] {
        assert!(resources.set(RT_ICON, id, LANGUAGE_ID_EN_US, vec![id as u8]).is_none());
    }
    assert_eq!(resources.ids(RT_ICON), vec![2, 5, 9]);

    let replaced = resources.set(RT_ICON, 5, LANGUAGE_ID_EN_US, vec![0xFF]).unwrap();
    assert_eq!(replaced.data(), &[5]);
    assert_eq!(resources.ids(RT_ICON), vec![2, 5, 9]);

    let built = resources.build(0x3000);
    assert_eq!(built.len() as u64, resources.size());
    let parsed = ResourceDirectory::parse(&built, 0, 0x3000).unwrap();
    assert_eq!(parsed.ids(RT_ICON), vec![2, 5, 9]);
    assert_eq!(parsed.get(RT_ICON, 5, LANGUAGE_ID_EN_US).unwrap().data(), &[0xFF]);
    assert!(parsed.get(RT_ICON, 5, 0).is_none());
}

#[test]
fn resource_directory_rejects_shared_tables() {
    init_logger();

    // root table with two type entries pointing at the same subdirectory at 0x20
    let mut data = vec![0u8; 0x30];
    put_u16(&mut data, 14, 2);
    put_u32(&mut data, 16, RT_ICON as u32);
    put_u32(&mut data, 20, 0x80000020);
    put_u32(&mut data, 24, RT_GROUP_ICON as u32);
    put_u32(&mut data, 28, 0x80000020);
    assert!(matches!(
        ResourceDirectory::parse(&data, 0, 0x3000),
        Err(ImageReadError::InvalidResourceTable(_))
    ));

    // a single reference parses into an empty type table
    put_u16(&mut data, 14, 1);
    let parsed = ResourceDirectory::parse(&data, 0, 0x3000).unwrap();
    assert!(parsed.ids(RT_ICON).is_empty());

    // an entry pointing back at the root table
    put_u32(&mut data, 20, 0x80000000);
    assert!(matches!(
        ResourceDirectory::parse(&data, 0, 0x3000),
        Err(ImageReadError::InvalidResourceTable(_))
    ));
}
