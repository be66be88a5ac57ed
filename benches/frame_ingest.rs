use bytes::BytesMut;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tokio_util::codec::Decoder;

use resilient_socket::core::{Delimiter, DelimiterCodec, find_delimiter};

const LINE: &[u8] =
    b"@badge-info=;color=#1E90FF;display-name=ferris :ferris!ferris@ferris.tmi.twitch.tv PRIVMSG #rust :hello there\r\n";

fn wire(lines: usize) -> Vec<u8> {
    LINE.repeat(lines)
}

fn drain(codec: &mut DelimiterCodec, buf: &mut BytesMut) -> usize {
    let mut frames = 0;
    while let Ok(Some(frame)) = codec.decode(buf) {
        black_box(frame);
        frames += 1;
    }
    frames
}

fn bench_decode(c: &mut Criterion) {
    let payload = wire(1000);

    c.bench_function("decode_1000_lines_single_read", |b| {
        b.iter(|| {
            let mut codec = DelimiterCodec::new(Delimiter::CRLF, 1024 * 1024);
            let mut buf = BytesMut::from(&payload[..]);
            black_box(drain(&mut codec, &mut buf));
        });
    });

    // Small reads split most delimiters and exercise the resume offset.
    c.bench_function("decode_1000_lines_7_byte_reads", |b| {
        b.iter(|| {
            let mut codec = DelimiterCodec::new(Delimiter::CRLF, 1024 * 1024);
            let mut buf = BytesMut::with_capacity(4096);
            let mut frames = 0;
            for chunk in payload.chunks(7) {
                buf.extend_from_slice(chunk);
                frames += drain(&mut codec, &mut buf);
            }
            black_box(frames);
        });
    });
}

fn bench_find_delimiter(c: &mut Criterion) {
    let line = &LINE[..LINE.len() - 2];
    let mut near_misses = line.to_vec();
    for chunk in near_misses.chunks_mut(16) {
        chunk[0] = b'\r';
    }
    near_misses.extend_from_slice(b"\r\n");

    c.bench_function("find_delimiter_at_end", |b| {
        b.iter(|| black_box(find_delimiter(black_box(LINE), b"\r\n")));
    });

    c.bench_function("find_delimiter_partial_candidates", |b| {
        b.iter(|| black_box(find_delimiter(black_box(&near_misses), b"\r\n")));
    });

    c.bench_function("find_delimiter_absent", |b| {
        b.iter(|| black_box(find_delimiter(black_box(line), b"\r\n")));
    });
}

criterion_group!(benches, bench_decode, bench_find_delimiter);
criterion_main!(benches);
