use crate::common::Operation::{Erase, Write};
use crate::common::{PAGE_HEADER_SIZE, PAGE_SIZE, RECORD_HEADER_SIZE, WORD_SIZE};
use nor_kv::KeyValue;
use pretty_assertions::assert_eq;

mod common;

const PAGE_STATE_OFFSET: u32 = 4;

#[test]
fn blank_flash() {
    let mut flash = common::Flash::new(2);

    let _kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();

    assert_eq!(
        flash.modifications(),
        vec![
            Erase {
                offset: 0,
                len: PAGE_SIZE,
            },
            Write {
                offset: 0,
                len: PAGE_HEADER_SIZE,
            },
            Erase {
                offset: PAGE_SIZE as _,
                len: PAGE_SIZE,
            },
            Write {
                offset: PAGE_SIZE as _,
                len: PAGE_HEADER_SIZE,
            },
        ]
    );
}

#[test]
fn single_value() {
    let mut flash = common::Flash::new(2);

    let _kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    flash.operations.clear();

    let mut kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    kv.set_key(1, &[0xAA; 64], true).unwrap();

    let record = PAGE_HEADER_SIZE as u32;
    assert_eq!(
        flash.modifications(),
        vec![
            Write {
                offset: PAGE_STATE_OFFSET,
                len: WORD_SIZE,
            },
            Write {
                offset: record,
                len: RECORD_HEADER_SIZE,
            },
            Write {
                offset: record + RECORD_HEADER_SIZE as u32,
                len: 64,
            },
            Write {
                offset: record,
                len: WORD_SIZE,
            },
        ]
    );
}

#[test]
fn update_and_delete() {
    let mut flash = common::Flash::new(2);

    let mut kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    kv.set_key(1, &[0xAA; 64], true).unwrap();
    flash.operations.clear();

    let mut kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    kv.set_key(1, &[0xBB; 64], true).unwrap();

    let old = PAGE_HEADER_SIZE as u32;
    let new = old + (RECORD_HEADER_SIZE + 64) as u32;
    assert_eq!(
        flash.modifications(),
        vec![
            // old record to deleting
            Write {
                offset: old,
                len: WORD_SIZE,
            },
            Write {
                offset: new,
                len: RECORD_HEADER_SIZE,
            },
            Write {
                offset: new + RECORD_HEADER_SIZE as u32,
                len: 64,
            },
            Write {
                offset: new,
                len: WORD_SIZE,
            },
            // old record to invalid
            Write {
                offset: old,
                len: WORD_SIZE,
            },
        ]
    );
    flash.operations.clear();

    let mut kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    kv.del_key(1).unwrap();

    assert_eq!(
        flash.modifications(),
        vec![Write {
            offset: new,
            len: WORD_SIZE,
        }]
    );
}

#[test]
fn unaligned_value() {
    let mut flash = common::Flash::new(2);

    let _kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    flash.operations.clear();

    let mut kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    kv.set_key(1, &[1, 2, 3, 4, 5, 6], true).unwrap();

    let record = PAGE_HEADER_SIZE as u32;
    let payload = record + RECORD_HEADER_SIZE as u32;
    assert_eq!(
        flash.modifications(),
        vec![
            Write {
                offset: PAGE_STATE_OFFSET,
                len: WORD_SIZE,
            },
            Write {
                offset: record,
                len: RECORD_HEADER_SIZE,
            },
            Write {
                offset: payload,
                len: WORD_SIZE,
            },
            // the tail is padded with ones
            Write {
                offset: payload + WORD_SIZE as u32,
                len: WORD_SIZE,
            },
            Write {
                offset: record,
                len: WORD_SIZE,
            },
        ]
    );

    let start = payload as usize;
    assert_eq!(flash.buf[start..start + 8], [1u8, 2, 3, 4, 5, 6, 0xFF, 0xFF]);
}

#[test]
fn reopening_is_read_only() {
    let mut flash = common::Flash::new(4);

    let mut kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    for id in 0..32 {
        kv.set_key(id, &[id as u8; 100], true).unwrap();
    }
    kv.del_key(3).unwrap();
    flash.operations.clear();

    let mut kv = KeyValue::new(0, flash.len(), &mut flash).unwrap();
    assert_eq!(kv.get_key(4).unwrap(), vec![4u8; 100]);

    assert_eq!(flash.modifications(), vec![]);
}
